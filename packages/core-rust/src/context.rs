use serde::Serialize;

use crate::types::{OrgId, OrgSource, ScopeId, Tier, UserId};

/// Proof that a tenant context has been written and verified on a scope.
///
/// Only produced by the tenant context store after a successful set; the
/// transactional permission path takes one as input so it cannot run before
/// the context exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveContext {
    /// Backing-store scope the context lives on.
    pub scope: ScopeId,
    /// User the context was set for.
    pub user_id: UserId,
    /// Organization the context was set for.
    pub org_id: OrgId,
}

/// Per-request tenant context handed to downstream handlers.
///
/// Built by the gate once every stage up to authorization has passed and
/// passed to the handler by value; it is never stored in ambient state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestContext {
    /// Authenticated user.
    pub user_id: UserId,
    /// Resolved organization.
    pub org_id: OrgId,
    /// Where `org_id` came from, retained for diagnostics.
    pub source: OrgSource,
    /// Scope the tenant context is active on. Queries that rely on
    /// row-level security must run on this scope.
    pub scope: ScopeId,
    /// Set when the user administers `org_id` (or is a super admin).
    pub is_admin: bool,
    /// Set when the user is a platform-wide super admin.
    pub is_super_admin: bool,
    /// Subscription tier of `org_id`, when the route needed it.
    pub tier: Option<Tier>,
}
