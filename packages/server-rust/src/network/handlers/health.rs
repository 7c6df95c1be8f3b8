//! Health and liveness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;

/// Returns health information as JSON.
///
/// `scopes_in_use` counts tenant scopes currently checked out by in-flight
/// requests; a value stuck at the pool size points at leaked leases.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": "ready",
        "scopes_in_use": state.gate.scopes_in_use(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe -- always returns 200 OK.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use axum::http::Request;
    use tenantgate_core::{OrgId, OrgRole, UserId};
    use tokio::sync::oneshot;

    use super::*;
    use crate::gate::{GateConfig, MemoryContextBackend, MemoryDirectory, RequestGate, RoutePolicy};
    use crate::network::auth::AuthenticatedUser;
    use crate::network::request::HttpGateRequest;

    struct TestState {
        app: AppState,
        directory: Arc<MemoryDirectory>,
    }

    fn test_state(config: GateConfig) -> TestState {
        let directory = Arc::new(MemoryDirectory::new());
        TestState {
            app: AppState {
                gate: RequestGate::new(
                    config,
                    Arc::new(MemoryContextBackend::new()),
                    directory.clone(),
                    directory.clone(),
                ),
                start_time: Instant::now(),
            },
            directory,
        }
    }

    #[tokio::test]
    async fn health_handler_returns_json_with_all_fields() {
        let response = health_handler(State(test_state(GateConfig::default()).app)).await;
        let json = response.0;

        assert_eq!(json["state"], "ready");
        assert_eq!(json["scopes_in_use"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_handler_reports_checked_out_scopes() {
        let state = test_state(GateConfig::default());
        let user = UserId::from("alice");
        let org = OrgId::parse("11111111-1111-1111-1111-111111111111").unwrap();
        state.directory.set_default_org(&user, org.to_string());
        state.directory.add_member(&user, org, OrgRole::Member);

        let mut parts = Request::builder().uri("/api/x").body(()).unwrap().into_parts().0;
        parts.extensions.insert(AuthenticatedUser(user));
        let req = HttpGateRequest::from_parts(&parts, None, false);

        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let gate = state.app.gate.clone();
        let task = tokio::spawn(async move {
            gate.handle(&req, &RoutePolicy::new(), |_| async move {
                let _ = entered_tx.send(());
                let _ = release_rx.await;
                Ok(())
            })
            .await
        });

        entered_rx.await.unwrap();
        let busy = health_handler(State(state.app.clone())).await;
        assert_eq!(busy.0["scopes_in_use"], 1);

        release_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        let idle = health_handler(State(state.app)).await;
        assert_eq!(idle.0["scopes_in_use"], 0);
    }

    #[tokio::test]
    async fn liveness_handler_always_returns_200() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }
}
