//! Tower integration for the gate.
//!
//! [`GateLayer`] wraps any service taking an [`Admitted`] request. The
//! wrapped service only ever sees requests that passed every stage of the
//! gate's pipeline, and its call runs as the gate's handler, so it inherits
//! the handler timeout, panic capture and guaranteed context cleanup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tenantgate_core::{GateRequest, RequestContext};
use tower::{Layer, Service, ServiceExt};

use super::error::GateError;
use super::pipeline::{Gated, RequestGate, RoutePolicy};

/// A request that passed the gate, with the context resolved for it.
#[derive(Debug)]
pub struct Admitted<Req> {
    pub context: RequestContext,
    pub request: Arc<Req>,
}

// ---------------------------------------------------------------------------
// GateLayer
// ---------------------------------------------------------------------------

/// Tower layer applying one [`RoutePolicy`] through a shared [`RequestGate`].
#[derive(Clone)]
pub struct GateLayer {
    gate: RequestGate,
    policy: Arc<RoutePolicy>,
}

impl GateLayer {
    #[must_use]
    pub fn new(gate: RequestGate, policy: RoutePolicy) -> Self {
        Self {
            gate,
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            gate: self.gate.clone(),
            policy: Arc::clone(&self.policy),
        }
    }
}

// ---------------------------------------------------------------------------
// GateService
// ---------------------------------------------------------------------------

/// Service wrapper that runs each request through the gate before the inner
/// service.
#[derive(Clone)]
pub struct GateService<S> {
    inner: S,
    gate: RequestGate,
    policy: Arc<RoutePolicy>,
}

impl<S, Req> Service<Req> for GateService<S>
where
    Req: GateRequest + 'static,
    S: Service<Admitted<Req>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Into<anyhow::Error>,
{
    type Response = Gated<S::Response>;
    type Error = GateError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, GateError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness of the inner service is awaited inside the handler so
        // that rejected requests never reserve inner capacity.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let gate = self.gate.clone();
        let policy = Arc::clone(&self.policy);
        let request = Arc::new(req);

        Box::pin(async move {
            let forwarded = Arc::clone(&request);
            gate.handle(request.as_ref(), &policy, move |context| async move {
                inner
                    .oneshot(Admitted {
                        context,
                        request: forwarded,
                    })
                    .await
                    .map_err(Into::into)
            })
            .await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use tenantgate_core::{OrgId, OrgRole, UserId};
    use tower::service_fn;

    use super::*;
    use crate::gate::config::GateConfig;
    use crate::gate::memory::{MemoryContextBackend, MemoryDirectory};

    const ORG: &str = "11111111-1111-1111-1111-111111111111";

    struct Req(Option<&'static str>);

    impl GateRequest for Req {
        fn user_id(&self) -> Option<UserId> {
            self.0.map(UserId::from)
        }
        fn route_param(&self, name: &str) -> Option<&str> {
            (name == "org").then_some(ORG)
        }
        fn header(&self, _: &str) -> Option<&str> {
            None
        }
        fn is_api_request(&self) -> bool {
            true
        }
    }

    fn gate(config: GateConfig) -> (RequestGate, Arc<MemoryContextBackend>) {
        let backend = Arc::new(MemoryContextBackend::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_member(&UserId::from("alice"), OrgId::parse(ORG).unwrap(), OrgRole::Member);
        (
            RequestGate::new(config, backend.clone(), directory.clone(), directory),
            backend,
        )
    }

    #[tokio::test]
    async fn admitted_request_reaches_inner_service() {
        let (gate, backend) = gate(GateConfig::default());
        let svc = GateLayer::new(gate, RoutePolicy::new()).layer(service_fn(
            |admitted: Admitted<Req>| async move {
                Ok::<_, Infallible>(admitted.context.org_id.to_string())
            },
        ));

        let gated = svc.oneshot(Req(Some("alice"))).await.unwrap();
        assert_eq!(gated.output, ORG);
        assert_eq!(backend.total_clears(), 1);
    }

    #[tokio::test]
    async fn rejected_request_never_reaches_inner_service() {
        let (gate, _) = gate(GateConfig::default());
        let svc = GateLayer::new(gate, RoutePolicy::new()).layer(service_fn(
            |_: Admitted<Req>| async move {
                if true {
                    panic!("inner service must not run");
                }
                Ok::<(), Infallible>(())
            },
        ));

        let err = svc.oneshot(Req(None)).await.unwrap_err();
        assert!(matches!(err, GateError::Unauthenticated));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_inner_service_times_out() {
        let (gate, backend) = gate(GateConfig {
            handler_timeout: Duration::from_millis(50),
            ..GateConfig::default()
        });
        let svc = GateLayer::new(gate, RoutePolicy::new()).layer(service_fn(
            |_: Admitted<Req>| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<(), Infallible>(())
            },
        ));

        let err = svc.oneshot(Req(Some("alice"))).await.unwrap_err();
        assert!(matches!(err, GateError::HandlerTimeout { timeout_ms: 50 }));
        assert_eq!(backend.total_clears(), 1);
    }

    #[tokio::test]
    async fn inner_error_becomes_handler_error() {
        let (gate, _) = gate(GateConfig::default());
        let svc = GateLayer::new(gate, RoutePolicy::new()).layer(service_fn(
            |_: Admitted<Req>| async move { Err::<(), _>(std::io::Error::other("disk full")) },
        ));

        let err = svc.oneshot(Req(Some("alice"))).await.unwrap_err();
        assert!(matches!(err, GateError::Handler(_)));
    }
}
