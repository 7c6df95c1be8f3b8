//! `RequestGate`: the per-request pipeline.
//!
//! Stages run strictly in order and any of them may short-circuit:
//!
//! 1. authenticate
//! 2. resolve the organization (route param, then session, then user default)
//! 3. check out a scope and set the tenant context on it
//! 4. membership and role checks
//! 5. rate limit (per route)
//! 6. permission (per route)
//! 7. handler, bounded by a timeout, with panics caught
//!
//! Once the context is written the scope is cleared exactly once on every
//! path out, including cancellation (see [`ContextGuard`]).
//!
//! [`ContextGuard`]: super::context_store::ContextGuard

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tenantgate_core::{
    ActiveContext, ContextBackend, GateRequest, OrgRole, OrgSource, PermissionResolver,
    RequestContext, Tier, UserDirectory, UserId,
};
use tracing::field::{display, Empty};
use tracing::{error, info_span, warn, Instrument, Span};

use super::config::GateConfig;
use super::context_store::{ContextGuard, TenantContextStore};
use super::error::{GateError, RequiredRole};
use super::permission::{PermissionChecker, PermissionOutcome};
use super::rate_limit::{RateDecision, RateLimitSnapshot, RateLimiter, RateSubject};
use super::response::ResponseShaper;
use super::scope::ScopeAllocator;

// ---------------------------------------------------------------------------
// RoutePolicy
// ---------------------------------------------------------------------------

/// Per-route requirements layered on top of the gate's fixed stages.
#[derive(Clone, Default)]
pub struct RoutePolicy {
    pub rate_limiter: Option<RateLimiter>,
    pub required_permission: Option<String>,
    pub required_role: Option<RequiredRole>,
}

impl RoutePolicy {
    /// Tenant context only: no rate limit, permission or role requirement.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rate_limited(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn require_permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permission = Some(permission.into());
        self
    }

    #[must_use]
    pub fn require_role(mut self, role: RequiredRole) -> Self {
        self.required_role = Some(role);
        self
    }
}

/// Handler output together with what the gate learned on the way in.
#[derive(Debug)]
pub struct Gated<T> {
    pub output: T,
    pub context: RequestContext,
    /// First window of the route's limiter, for response headers.
    pub rate_limit: Option<RateLimitSnapshot>,
}

// ---------------------------------------------------------------------------
// RequestGate
// ---------------------------------------------------------------------------

struct GateInner {
    config: GateConfig,
    store: TenantContextStore,
    scopes: ScopeAllocator,
    directory: Arc<dyn UserDirectory>,
    permissions: PermissionChecker,
    shaper: ResponseShaper,
}

/// Tenant-aware request gate. Cheap to clone; clones share scopes and
/// collaborators.
#[derive(Clone)]
pub struct RequestGate {
    inner: Arc<GateInner>,
}

impl RequestGate {
    #[must_use]
    pub fn new(
        config: GateConfig,
        backend: Arc<dyn ContextBackend>,
        directory: Arc<dyn UserDirectory>,
        resolver: Arc<dyn PermissionResolver>,
    ) -> Self {
        let scopes = ScopeAllocator::new(config.scope_strategy);
        let shaper = ResponseShaper::new(&config);
        Self {
            inner: Arc::new(GateInner {
                store: TenantContextStore::new(backend),
                scopes,
                directory,
                permissions: PermissionChecker::new(resolver),
                shaper,
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn shaper(&self) -> &ResponseShaper {
        &self.inner.shaper
    }

    #[must_use]
    pub fn store(&self) -> &TenantContextStore {
        &self.inner.store
    }

    /// Scopes currently checked out by in-flight requests.
    #[must_use]
    pub fn scopes_in_use(&self) -> u64 {
        self.inner.scopes.in_use()
    }

    /// Runs `req` through every stage and, if all pass, invokes `handler`
    /// with the resolved [`RequestContext`].
    ///
    /// # Errors
    ///
    /// The first stage that rejects the request, or the handler's failure
    /// (error, panic or timeout), as a [`GateError`].
    pub async fn handle<R, F, Fut, T>(
        &self,
        req: &R,
        policy: &RoutePolicy,
        handler: F,
    ) -> Result<Gated<T>, GateError>
    where
        R: GateRequest + ?Sized,
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let span = info_span!(
            "gate",
            route = req.route(),
            user_id = Empty,
            org_id = Empty,
            scope = Empty,
            outcome = Empty,
        );
        async {
            let result = self.run(req, policy, handler).await;
            Self::record_outcome(req, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn run<R, F, Fut, T>(
        &self,
        req: &R,
        policy: &RoutePolicy,
        handler: F,
    ) -> Result<Gated<T>, GateError>
    where
        R: GateRequest + ?Sized,
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let user = req.user_id().ok_or(GateError::Unauthenticated)?;
        Span::current().record("user_id", user.as_str());

        let (raw_org, source) = self.resolve_org(req, &user).await?;

        let lease = self
            .inner
            .scopes
            .checkout(self.inner.config.scope_checkout_timeout)
            .await?;
        Span::current().record("scope", display(lease.scope()));
        let mut guard = self.inner.store.guard(lease);

        let result = self
            .run_scoped(&mut guard, req, policy, handler, &user, &raw_org, source)
            .await;
        guard.release().await;
        result
    }

    /// Stages 3 to 7. Everything here runs while `guard` owns the scope.
    #[allow(clippy::too_many_arguments)]
    async fn run_scoped<R, F, Fut, T>(
        &self,
        guard: &mut ContextGuard,
        req: &R,
        policy: &RoutePolicy,
        handler: F,
        user: &UserId,
        raw_org: &str,
        source: OrgSource,
    ) -> Result<Gated<T>, GateError>
    where
        R: GateRequest + ?Sized,
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let active = guard.set(user, raw_org).await?;
        Span::current().record("org_id", display(&active.org_id));

        let (is_admin, is_super_admin) = self.check_roles(&active, policy).await?;
        let tier = self.resolve_tier(&active, policy).await;

        let mut rate_limit = None;
        if let Some(limiter) = &policy.rate_limiter {
            let subject = RateSubject {
                user: Some(user),
                ip: req.client_ip(),
                org: Some(&active.org_id),
            };
            match limiter.check(&subject, tier.unwrap_or(Tier::Free)).await? {
                RateDecision::Allowed(snapshot) => rate_limit = snapshot,
                RateDecision::Limited(exceeded) => return Err(GateError::RateLimited(exceeded)),
            }
        }

        if let Some(permission) = &policy.required_permission {
            match self.inner.permissions.check(&active, permission).await {
                PermissionOutcome::Granted(_) => {}
                PermissionOutcome::Denied(_) => {
                    return Err(GateError::Forbidden {
                        permission: permission.clone(),
                    });
                }
                PermissionOutcome::Failed {
                    transactional,
                    direct,
                } => {
                    return Err(GateError::PermissionCheckFailed {
                        permission: permission.clone(),
                        transactional,
                        direct,
                    });
                }
            }
        }

        let context = RequestContext {
            user_id: active.user_id,
            org_id: active.org_id,
            source,
            scope: active.scope,
            is_admin,
            is_super_admin,
            tier,
        };
        let output = self.invoke(handler, context.clone()).await?;
        Ok(Gated {
            output,
            context,
            rate_limit,
        })
    }

    /// Route param, then session, then the user's stored default. The value
    /// is returned raw; UUID validation happens when the context is set.
    async fn resolve_org<R>(&self, req: &R, user: &UserId) -> Result<(String, OrgSource), GateError>
    where
        R: GateRequest + ?Sized,
    {
        let config = &self.inner.config;
        let explicit = non_empty(req.route_param(&config.org_route_param))
            .map(|org| (org.to_string(), OrgSource::RouteParam))
            .or_else(|| {
                non_empty(req.session_value(&config.session_org_key))
                    .map(|org| (org.to_string(), OrgSource::Session))
            });
        if let Some(found) = explicit {
            return Ok(found);
        }

        let stored = self
            .inner
            .directory
            .default_org(user)
            .await
            .map_err(GateError::Directory)?;
        match stored {
            Some(org) if !org.trim().is_empty() => Ok((org, OrgSource::UserDefault)),
            _ => Err(GateError::NoOrganization {
                user_id: user.clone(),
            }),
        }
    }

    /// Membership verification and role requirements. Returns
    /// `(is_admin, is_super_admin)`.
    async fn check_roles(
        &self,
        active: &ActiveContext,
        policy: &RoutePolicy,
    ) -> Result<(bool, bool), GateError> {
        let directory = &self.inner.directory;
        let is_super_admin = directory
            .is_super_admin(&active.user_id)
            .await
            .map_err(GateError::Directory)?;
        let role = directory
            .membership(&active.user_id, &active.org_id)
            .await
            .map_err(GateError::Directory)?;

        if self.inner.config.verify_membership && role.is_none() && !is_super_admin {
            return Err(GateError::OrgAccessDenied {
                user_id: active.user_id.clone(),
                org_id: active.org_id,
            });
        }

        let is_admin = is_super_admin || role.is_some_and(OrgRole::is_admin);
        let satisfied = match policy.required_role {
            None => true,
            Some(RequiredRole::Admin) => is_admin,
            Some(RequiredRole::SuperAdmin) => is_super_admin,
        };
        if let (false, Some(required)) = (satisfied, policy.required_role) {
            return Err(GateError::InsufficientRole {
                user_id: active.user_id.clone(),
                org_id: active.org_id,
                required,
            });
        }
        Ok((is_admin, is_super_admin))
    }

    /// Subscription tier, looked up only for tiered limiters. A failed
    /// lookup scales like an unknown plan.
    async fn resolve_tier(&self, active: &ActiveContext, policy: &RoutePolicy) -> Option<Tier> {
        let limiter = policy.rate_limiter.as_ref()?;
        if !limiter.config().tiered {
            return None;
        }
        match self.inner.directory.subscription_tier(&active.org_id).await {
            Ok(tier) => Some(tier),
            Err(e) => {
                warn!(org_id = %active.org_id, error = ?e, "subscription lookup failed; using base limits");
                Some(Tier::Unknown)
            }
        }
    }

    async fn invoke<F, Fut, T>(&self, handler: F, context: RequestContext) -> Result<T, GateError>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let timeout = self.inner.config.handler_timeout;
        let call = AssertUnwindSafe(async move { handler(context).await }).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Err(_elapsed) => Err(GateError::HandlerTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Ok(Err(panic)) => Err(GateError::HandlerPanicked {
                message: panic_message(panic.as_ref()),
            }),
            Ok(Ok(result)) => result.map_err(GateError::Handler),
        }
    }

    fn record_outcome<R, T>(req: &R, result: &Result<Gated<T>, GateError>)
    where
        R: GateRequest + ?Sized,
    {
        let span = Span::current();
        let code = match result {
            Ok(_) => "OK",
            Err(e) => e.code(),
        };
        span.record("outcome", code);
        metrics::counter!("tenantgate_requests_total", "outcome" => code).increment(1);

        let Err(err) = result else {
            return;
        };
        let route = req.route();
        let ip = req.client_ip().map(display);
        if err.kind().is_client_caused() {
            warn!(code, route, ip, kind = ?err.kind(), "request rejected");
        } else {
            error!(code, route, ip, kind = ?err.kind(), error = ?err, "request failed");
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
