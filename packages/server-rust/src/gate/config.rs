use std::time::Duration;

use http::StatusCode;

use super::scope::ScopeStrategy;

/// Gate-level configuration shared by every route behind one `RequestGate`.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Include internal error detail in rejection envelopes. Never enable in
    /// production.
    pub debug: bool,
    /// Name of the route parameter carrying an explicit organization id.
    pub org_route_param: String,
    /// Session key holding the user's "current org".
    pub session_org_key: String,
    /// Status used when no organization can be resolved.
    pub missing_org_policy: MissingOrgPolicy,
    /// Reject users who are not members of the resolved organization.
    pub verify_membership: bool,
    /// Maximum time the downstream handler may run.
    pub handler_timeout: Duration,
    /// How backing-store scopes are allocated.
    pub scope_strategy: ScopeStrategy,
    /// How long to wait for a pooled scope before rejecting.
    pub scope_checkout_timeout: Duration,
    /// Contact shown to users denied access to an organization.
    pub admin_contact: Option<String>,
    /// Where browser callers are redirected when unauthenticated.
    pub login_path: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            debug: false,
            org_route_param: "org".to_string(),
            session_org_key: "current_org_id".to_string(),
            missing_org_policy: MissingOrgPolicy::Forbidden,
            verify_membership: true,
            handler_timeout: Duration::from_secs(30),
            scope_strategy: ScopeStrategy::PerRequest,
            scope_checkout_timeout: Duration::from_secs(5),
            admin_contact: None,
            login_path: "/login".to_string(),
        }
    }
}

/// Response status for requests without a resolvable organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingOrgPolicy {
    BadRequest,
    Forbidden,
}

impl MissingOrgPolicy {
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limiter configuration
// ---------------------------------------------------------------------------

/// What a limiter counts requests against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// `user:<id>` when authenticated, else `ip:<addr>`.
    User,
    /// Always `ip:<addr>`.
    Ip,
    /// `org:<id>`, shared by every member of the organization.
    Org,
}

/// Behavior when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Let the request through and log a warning.
    FailOpen,
    /// Reject the request.
    FailClosed,
}

/// One counting window of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    /// Requests allowed per window before tier scaling.
    pub base_limit: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl WindowLimit {
    #[must_use]
    pub fn per_minute(base_limit: u64) -> Self {
        Self {
            base_limit,
            window_secs: 60,
        }
    }

    #[must_use]
    pub fn per_hour(base_limit: u64) -> Self {
        Self {
            base_limit,
            window_secs: 3600,
        }
    }
}

/// Configuration of one limiter instance.
///
/// Windows are checked in order; the first exceeded window decides the
/// rejection and its `retry_after`.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Limiter name, used as the counter key prefix.
    pub name: String,
    pub scope: LimitScope,
    pub windows: Vec<WindowLimit>,
    /// Scale limits by the organization's subscription tier.
    pub tiered: bool,
    pub on_store_error: FailurePolicy,
}

impl LimiterConfig {
    /// General API limiter: 60 requests/minute per user, fail-closed.
    #[must_use]
    pub fn api() -> Self {
        Self {
            name: "api".to_string(),
            scope: LimitScope::User,
            windows: vec![WindowLimit::per_minute(60)],
            tiered: false,
            on_store_error: FailurePolicy::FailClosed,
        }
    }

    /// AI-service limiter: 30/minute and 500/hour per user, tier-scaled,
    /// fail-open.
    #[must_use]
    pub fn ai() -> Self {
        Self {
            name: "ai".to_string(),
            scope: LimitScope::User,
            windows: vec![WindowLimit::per_minute(30), WindowLimit::per_hour(500)],
            tiered: true,
            on_store_error: FailurePolicy::FailOpen,
        }
    }
}
