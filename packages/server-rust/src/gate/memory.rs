//! In-memory collaborators backed by [`DashMap`].
//!
//! [`MemoryContextBackend`] stands in for database session variables and
//! [`MemoryDirectory`] for the user/membership/grant tables. Both are used by
//! the demo server and the test suites; production deployments plug in
//! database-backed implementations of the same traits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tenantgate_core::{
    ActiveContext, ContextBackend, OrgId, OrgRole, PermissionResolver, ScopeId, Tier,
    UserDirectory, UserId,
};

// ---------------------------------------------------------------------------
// MemoryContextBackend
// ---------------------------------------------------------------------------

/// Session-variable store keyed by scope.
///
/// Each scope has its own key/value map; nothing written to one scope is
/// visible from another. A cleared scope leaves no entry behind, so memory
/// stays bounded by the number of scopes holding a context.
///
/// Per-scope clear counts are only kept by [`MemoryContextBackend::tracking`]
/// backends, since per-request scope ids are never reused.
#[derive(Debug, Default)]
pub struct MemoryContextBackend {
    scopes: DashMap<ScopeId, HashMap<String, String>>,
    total_clears: AtomicU64,
    clear_log: Option<DashMap<ScopeId, u64>>,
}

impl MemoryContextBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that also records how often each scope was cleared.
    /// The log grows with every distinct scope; use it in tests only.
    #[must_use]
    pub fn tracking() -> Self {
        Self {
            clear_log: Some(DashMap::new()),
            ..Self::default()
        }
    }

    /// Whether `scope` currently holds no values.
    #[must_use]
    pub fn is_empty(&self, scope: ScopeId) -> bool {
        self.scopes.get(&scope).map_or(true, |vars| vars.is_empty())
    }

    /// How many times `scope` has been cleared, or `None` when this backend
    /// was not built with [`MemoryContextBackend::tracking`].
    #[must_use]
    pub fn clear_count(&self, scope: ScopeId) -> Option<u64> {
        self.clear_log
            .as_ref()
            .map(|log| log.get(&scope).map_or(0, |c| *c))
    }

    /// Total number of clears across all scopes.
    #[must_use]
    pub fn total_clears(&self) -> u64 {
        self.total_clears.load(Ordering::Relaxed)
    }

    /// Number of scopes with an entry, empty or not.
    #[must_use]
    pub fn tracked_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Number of scopes holding at least one value.
    #[must_use]
    pub fn active_scopes(&self) -> usize {
        self.scopes.iter().filter(|s| !s.value().is_empty()).count()
    }
}

#[async_trait]
impl ContextBackend for MemoryContextBackend {
    async fn set(&self, scope: ScopeId, key: &str, value: &str) -> anyhow::Result<()> {
        self.scopes
            .entry(scope)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, scope: ScopeId, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .scopes
            .get(&scope)
            .and_then(|vars| vars.get(key).cloned()))
    }

    async fn clear(&self, scope: ScopeId) -> anyhow::Result<()> {
        self.scopes.remove(&scope);
        self.total_clears.fetch_add(1, Ordering::Relaxed);
        if let Some(log) = &self.clear_log {
            *log.entry(scope).or_insert(0) += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDirectory
// ---------------------------------------------------------------------------

/// Users, memberships, subscriptions and permission grants held in memory.
///
/// Permissions are granted per (user, org). Both resolution paths read the
/// same grants; the transactional path additionally requires the grant to
/// belong to the context's own org, mirroring row-level security.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    default_orgs: DashMap<UserId, String>,
    memberships: DashMap<(UserId, OrgId), OrgRole>,
    super_admins: DashMap<UserId, ()>,
    tiers: DashMap<OrgId, Tier>,
    grants: DashMap<(UserId, OrgId), HashSet<String>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stored default organization of `user` (raw, unvalidated).
    pub fn set_default_org(&self, user: &UserId, org: impl Into<String>) {
        self.default_orgs.insert(user.clone(), org.into());
    }

    /// Adds `user` to `org` with `role`.
    pub fn add_member(&self, user: &UserId, org: OrgId, role: OrgRole) {
        self.memberships.insert((user.clone(), org), role);
    }

    /// Marks `user` as a platform super admin.
    pub fn add_super_admin(&self, user: &UserId) {
        self.super_admins.insert(user.clone(), ());
    }

    /// Sets the subscription tier of `org`.
    pub fn set_tier(&self, org: OrgId, tier: Tier) {
        self.tiers.insert(org, tier);
    }

    /// Grants `permission` to `user` within `org`.
    pub fn grant(&self, user: &UserId, org: OrgId, permission: impl Into<String>) {
        self.grants
            .entry((user.clone(), org))
            .or_default()
            .insert(permission.into());
    }

    fn has_grant(&self, user: &UserId, org: OrgId, permission: &str) -> bool {
        self.grants
            .get(&(user.clone(), org))
            .is_some_and(|set| set.contains(permission) || set.contains("*"))
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn default_org(&self, user: &UserId) -> anyhow::Result<Option<String>> {
        Ok(self.default_orgs.get(user).map(|o| o.value().clone()))
    }

    async fn membership(&self, user: &UserId, org: &OrgId) -> anyhow::Result<Option<OrgRole>> {
        Ok(self.memberships.get(&(user.clone(), *org)).map(|r| *r))
    }

    async fn is_super_admin(&self, user: &UserId) -> anyhow::Result<bool> {
        Ok(self.super_admins.contains_key(user))
    }

    async fn subscription_tier(&self, org: &OrgId) -> anyhow::Result<Tier> {
        Ok(self.tiers.get(org).map_or(Tier::Free, |t| *t))
    }
}

#[async_trait]
impl PermissionResolver for MemoryDirectory {
    async fn check_transactional(
        &self,
        ctx: &ActiveContext,
        permission: &str,
    ) -> anyhow::Result<bool> {
        Ok(self.has_grant(&ctx.user_id, ctx.org_id, permission))
    }

    async fn check_direct(
        &self,
        user: &UserId,
        org: &OrgId,
        permission: &str,
    ) -> anyhow::Result<bool> {
        Ok(self.has_grant(user, *org, permission))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
