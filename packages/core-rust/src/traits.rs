use std::net::IpAddr;

use async_trait::async_trait;

use crate::context::ActiveContext;
use crate::types::{OrgId, OrgRole, ScopeId, Tier, UserId};

/// Inbound request as seen by the gate.
///
/// Implemented by transport adapters (the axum adapter, test fixtures). The
/// gate only reads from it.
pub trait GateRequest: Send + Sync {
    /// Authenticated user, if an upstream authenticator resolved one.
    fn user_id(&self) -> Option<UserId>;

    /// Value of a named route/path parameter.
    fn route_param(&self, name: &str) -> Option<&str>;

    /// Value of a request header (case-insensitive name).
    fn header(&self, name: &str) -> Option<&str>;

    /// Whether the caller expects a machine-readable (JSON) response.
    fn is_api_request(&self) -> bool;

    /// Session or request-scoped value, e.g. the "current org" a browser
    /// user switched to.
    fn session_value(&self, _key: &str) -> Option<&str> {
        None
    }

    /// Remote address of the caller, used for anonymous rate-limit keys.
    fn client_ip(&self) -> Option<IpAddr> {
        None
    }

    /// Route label used in logs.
    fn route(&self) -> &str {
        ""
    }
}

/// Session-variable store backing tenant context (e.g. `set_config` on a
/// pooled database connection).
///
/// Values written to one scope are never visible from another.
#[async_trait]
pub trait ContextBackend: Send + Sync {
    /// Writes `value` under `key` in `scope`.
    async fn set(&self, scope: ScopeId, key: &str, value: &str) -> anyhow::Result<()>;

    /// Reads `key` from `scope`. `None` when unset.
    async fn get(&self, scope: ScopeId, key: &str) -> anyhow::Result<Option<String>>;

    /// Removes every key in `scope`. Clearing an empty scope succeeds.
    async fn clear(&self, scope: ScopeId) -> anyhow::Result<()>;
}

/// Shared fixed-window counter store.
///
/// `hit` must be atomic with respect to concurrent callers on the same key:
/// two concurrent hits always yield two distinct counts.
#[async_trait]
pub trait RateCounter: Send + Sync {
    /// Increments the counter for `key`, opening a window of `window_secs`
    /// when none is active. Returns the count after the increment.
    async fn hit(&self, key: &str, window_secs: u64) -> anyhow::Result<u64>;

    /// Current count for `key` in its active window; 0 without a window.
    async fn attempts(&self, key: &str) -> anyhow::Result<u64>;

    /// Seconds until the active window for `key` resets; 0 without a window.
    async fn available_in(&self, key: &str) -> anyhow::Result<u64>;

    /// Drops the window for `key`.
    async fn reset(&self, key: &str) -> anyhow::Result<()>;

    /// Whether `key` has reached `limit` in its active window.
    async fn too_many_attempts(&self, key: &str, limit: u64) -> anyhow::Result<bool> {
        Ok(self.attempts(key).await? >= limit)
    }

    /// Hits left before `limit` is reached. Never negative.
    async fn remaining(&self, key: &str, limit: u64) -> anyhow::Result<u64> {
        Ok(limit.saturating_sub(self.attempts(key).await?))
    }
}

/// Resolves permission grants. The gate owns the resolution protocol, not
/// the grant storage.
#[async_trait]
pub trait PermissionResolver: Send + Sync {
    /// Resolves `permission` through the active tenant context (row-level
    /// security bound queries on the context's scope).
    async fn check_transactional(
        &self,
        ctx: &ActiveContext,
        permission: &str,
    ) -> anyhow::Result<bool>;

    /// Resolves `permission` without relying on ambient context.
    async fn check_direct(
        &self,
        user: &UserId,
        org: &OrgId,
        permission: &str,
    ) -> anyhow::Result<bool>;
}

/// Read access to users, memberships and subscriptions.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Stored default/active organization of `user`, as raw text.
    async fn default_org(&self, user: &UserId) -> anyhow::Result<Option<String>>;

    /// Role of `user` in `org`; `None` when the user is not a member.
    async fn membership(&self, user: &UserId, org: &OrgId) -> anyhow::Result<Option<OrgRole>>;

    /// Whether `user` is a platform-wide super admin.
    async fn is_super_admin(&self, user: &UserId) -> anyhow::Result<bool>;

    /// Subscription tier of `org`.
    async fn subscription_tier(&self, org: &OrgId) -> anyhow::Result<Tier>;
}
