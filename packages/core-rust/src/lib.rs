//! Tenantgate core: tenant identifiers, the per-request context and the
//! collaborator traits the gate consumes.

pub mod context;
pub mod traits;
pub mod types;

pub use context::{ActiveContext, RequestContext};
pub use traits::{ContextBackend, GateRequest, PermissionResolver, RateCounter, UserDirectory};
pub use types::{InvalidOrgId, OrgId, OrgRole, OrgSource, ScopeId, Tier, UserId};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
