//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` captures configuration,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. The bound port is known after `start()`, so callers can
//! log or advertise it before any request is accepted.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{health_handler, liveness_handler, AppState};
use super::middleware::with_http_layers;
use crate::gate::RequestGate;

/// Manages the HTTP server lifecycle.
///
/// 1. `new()` -- stores configuration and the gate
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    gate: RequestGate,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, gate: RequestGate) -> Self {
        Self {
            config,
            gate,
            listener: None,
        }
    }

    /// Assembles the full router: server routes, the gated application
    /// routes in `app`, and the transport middleware around both.
    ///
    /// Server routes:
    /// - `GET /health` -- health JSON including scopes in use
    /// - `GET /health/live` -- liveness probe
    pub fn build_router(&self, app: Router) -> Router {
        let state = AppState {
            gate: self.gate.clone(),
            start_time: Instant::now(),
        };

        let server_routes = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .with_state(state);

        with_http_layers(server_routes.merge(app), &self.config)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves `app` (plus the server routes) until `shutdown` resolves, then
    /// waits for in-flight requests to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server
    /// hits a fatal I/O error.
    pub async fn serve(
        mut self,
        app: Router,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router(app);

        info!("Serving HTTP connections");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!(
            scopes_in_use = self.gate.scopes_in_use(),
            "server stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::gate::{GateConfig, MemoryContextBackend, MemoryDirectory};

    fn module() -> NetworkModule {
        let directory = Arc::new(MemoryDirectory::new());
        let gate = RequestGate::new(
            GateConfig::default(),
            Arc::new(MemoryContextBackend::new()),
            directory.clone(),
            directory,
        );
        NetworkModule::new(NetworkConfig::default(), gate)
    }

    #[test]
    fn new_creates_module_without_binding() {
        assert!(module().listener.is_none());
    }

    #[tokio::test]
    async fn router_merges_app_routes_with_health() {
        let app = Router::new().route("/hello", get(|| async { "hi" }));
        let router = module().build_router(app);

        let health = router
            .clone()
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let hello = router
            .oneshot(Request::get("/hello").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(hello.status(), StatusCode::OK);
        assert!(hello.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module()
            .serve(Router::new(), std::future::ready(()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_signal() {
        let mut module = module();
        module.start().await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(Router::new(), async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
