//! Axum middleware running routes through the [`RequestGate`].
//!
//! Apply with `route_layer` so path parameters are available:
//!
//! ```ignore
//! Router::new()
//!     .route("/api/orgs/{org}/posts", post(create_post))
//!     .route_layer(from_fn_with_state(GateState::new(gate, policy), gate_middleware))
//! ```
//!
//! Admitted requests reach the handler with a [`RequestContext`] extension;
//! rejections are rendered as JSON envelopes, except unauthenticated browser
//! callers who are redirected to the login page.
//!
//! [`RequestContext`]: tenantgate_core::RequestContext

use std::sync::Arc;

use axum::extract::rejection::RawPathParamsRejection;
use axum::extract::{RawPathParams, Request, State};
use axum::http::header::ACCEPT_LANGUAGE;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use tenantgate_core::GateRequest;

use super::request::HttpGateRequest;
use crate::gate::{rate_limit_headers, GateError, Locale, RequestGate, RoutePolicy, ShapedResponse};

/// Gate plus the policy of the routes it guards.
#[derive(Clone)]
pub struct GateState {
    pub gate: RequestGate,
    pub policy: Arc<RoutePolicy>,
    /// Take the client address from `X-Forwarded-For` instead of the peer.
    pub trust_forwarded_for: bool,
}

impl GateState {
    #[must_use]
    pub fn new(gate: RequestGate, policy: RoutePolicy) -> Self {
        Self {
            gate,
            policy: Arc::new(policy),
            trust_forwarded_for: false,
        }
    }

    /// See [`NetworkConfig::trust_forwarded_for`](super::NetworkConfig::trust_forwarded_for).
    #[must_use]
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

impl IntoResponse for ShapedResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, Json(self.envelope)).into_response()
    }
}

/// Runs the request through the gate and, if admitted, the rest of the
/// stack.
pub async fn gate_middleware(
    State(state): State<GateState>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let view = HttpGateRequest::from_parts(
        &parts,
        params.as_ref().ok(),
        state.trust_forwarded_for,
    );
    let req = Request::from_parts(parts, body);

    let result = state
        .gate
        .handle(&view, &state.policy, |context| async move {
            let mut req = req;
            req.extensions_mut().insert(context);
            Ok(next.run(req).await)
        })
        .await;

    match result {
        Ok(gated) => {
            let mut response = gated.output;
            if let Some(snapshot) = &gated.rate_limit {
                response.headers_mut().extend(rate_limit_headers(snapshot));
            }
            response
        }
        Err(GateError::Unauthenticated) if !view.is_api_request() => {
            Redirect::to(&state.gate.config().login_path).into_response()
        }
        Err(err) => {
            let locale = Locale::from_accept_language(view.header(ACCEPT_LANGUAGE.as_str()));
            state.gate.shaper().reject(&err, locale).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::middleware::{from_fn, from_fn_with_state};
    use axum::routing::get;
    use axum::{Extension, Router};
    use serde_json::Value;
    use tenantgate_core::{OrgId, OrgRole, RequestContext, UserId};
    use tower::ServiceExt;

    use super::*;
    use crate::gate::{
        GateConfig, LimitScope, LimiterConfig, MemoryContextBackend, MemoryDirectory,
        MemoryRateCounter, RateLimiter, WindowLimit,
    };
    use crate::network::auth::AuthenticatedUser;

    const ORG: &str = "11111111-1111-1111-1111-111111111111";

    async fn whoami(Extension(ctx): Extension<RequestContext>) -> String {
        format!("{}@{}", ctx.user_id, ctx.org_id)
    }

    /// Test stand-in for the JWT layer: `x-test-user` becomes the identity.
    async fn fake_auth(mut req: Request<Body>, next: Next) -> Response {
        if let Some(user) = req
            .headers()
            .get("x-test-user")
            .and_then(|v| v.to_str().ok())
            .map(UserId::from)
        {
            req.extensions_mut().insert(AuthenticatedUser(user));
        }
        next.run(req).await
    }

    fn app(policy: RoutePolicy) -> (Router, Arc<MemoryContextBackend>) {
        app_with(policy, false)
    }

    fn app_with(
        policy: RoutePolicy,
        trust_forwarded_for: bool,
    ) -> (Router, Arc<MemoryContextBackend>) {
        let backend = Arc::new(MemoryContextBackend::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_member(&UserId::from("alice"), OrgId::parse(ORG).unwrap(), OrgRole::Member);
        let gate = RequestGate::new(
            GateConfig::default(),
            backend.clone(),
            directory.clone(),
            directory,
        );
        let router = Router::new()
            .route("/api/orgs/{org}/whoami", get(whoami))
            .route("/orgs/{org}/dashboard", get(whoami))
            .route_layer(from_fn_with_state(
                GateState::new(gate, policy).trust_forwarded_for(trust_forwarded_for),
                gate_middleware,
            ))
            .layer(from_fn(fake_auth));
        (router, backend)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn admitted_request_sees_context() {
        let (router, backend) = app(RoutePolicy::new());
        let response = router
            .oneshot(
                Request::get(format!("/api/orgs/{ORG}/whoami"))
                    .header("x-test-user", "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes, format!("alice@{ORG}"));
        assert_eq!(backend.total_clears(), 1);
    }

    #[tokio::test]
    async fn api_caller_gets_401_envelope() {
        let (router, _) = app(RoutePolicy::new());
        let response = router
            .oneshot(
                Request::get(format!("/api/orgs/{ORG}/whoami"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn browser_caller_is_redirected_to_login() {
        let (router, _) = app(RoutePolicy::new());
        let response = router
            .oneshot(
                Request::get(format!("/orgs/{ORG}/dashboard"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        assert_eq!(response.headers()["location"], "/login");
    }

    #[tokio::test]
    async fn arabic_caller_gets_arabic_message() {
        let (router, _) = app(RoutePolicy::new());
        let response = router
            .oneshot(
                Request::get("/api/orgs/22222222-2222-2222-2222-222222222222/whoami")
                    .header("x-test-user", "alice")
                    .header("accept-language", "ar")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["error"], "ORG_ACCESS_DENIED");
        assert_eq!(json["message"], "ليس لديك صلاحية الوصول إلى هذه المؤسسة.");
    }

    #[tokio::test]
    async fn rate_limit_headers_on_success_and_rejection() {
        let limiter = RateLimiter::new(
            LimiterConfig {
                windows: vec![WindowLimit::per_minute(1)],
                ..LimiterConfig::api()
            },
            Arc::new(MemoryRateCounter::new()),
        );
        let (router, _) = app(RoutePolicy::new().rate_limited(limiter));
        let request = || {
            Request::get(format!("/api/orgs/{ORG}/whoami"))
                .header("x-test-user", "alice")
                .body(Body::empty())
                .unwrap()
        };

        let ok = router.clone().oneshot(request()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()["x-ratelimit-limit"], "1");
        assert_eq!(ok.headers()["x-ratelimit-remaining"], "0");

        let limited = router.oneshot(request()).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().contains_key("retry-after"));
        let json = body_json(limited).await;
        assert_eq!(json["error"], "RATE_LIMIT_EXCEEDED");
        assert!(json["retry_after"].as_u64().unwrap() <= 60);
    }

    fn per_ip_limit_of_one() -> RoutePolicy {
        RoutePolicy::new().rate_limited(RateLimiter::new(
            LimiterConfig {
                scope: LimitScope::Ip,
                windows: vec![WindowLimit::per_minute(1)],
                ..LimiterConfig::api()
            },
            Arc::new(MemoryRateCounter::new()),
        ))
    }

    async fn status_from(router: &Router, forwarded_for: &str) -> StatusCode {
        router
            .clone()
            .oneshot(
                Request::get(format!("/api/orgs/{ORG}/whoami"))
                    .header("x-test-user", "alice")
                    .header("x-forwarded-for", forwarded_for)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn rotating_forwarded_for_does_not_reset_ip_limit() {
        let (router, _) = app(per_ip_limit_of_one());
        assert_eq!(status_from(&router, "198.51.100.1").await, StatusCode::OK);
        assert_eq!(
            status_from(&router, "198.51.100.2").await,
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn trusted_forwarded_for_keys_ip_limit() {
        let (router, _) = app_with(per_ip_limit_of_one(), true);
        assert_eq!(status_from(&router, "198.51.100.1").await, StatusCode::OK);
        assert_eq!(status_from(&router, "198.51.100.2").await, StatusCode::OK);
        assert_eq!(
            status_from(&router, "198.51.100.1").await,
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
