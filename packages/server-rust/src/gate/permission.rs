//! Permission resolution with a single stateless fallback.
//!
//! State machine for one check:
//!
//! ```text
//! Start -> TryTransactional -> Resolved(bool)
//!                           -> TransactionalError -> TryDirect -> Resolved(bool)
//!                                                              -> Failed
//! ```
//!
//! Only a resolution *error* on the transactional path moves to the direct
//! path. A clean `false` is authoritative. The direct path runs at most once.

use std::sync::Arc;

use tenantgate_core::{ActiveContext, PermissionResolver};
use tracing::{debug, warn};

/// Which path produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPath {
    Transactional,
    Direct,
}

/// States of a single permission check.
#[derive(Debug)]
enum CheckState {
    Start,
    TryTransactional,
    TransactionalError(anyhow::Error),
    TryDirect(anyhow::Error),
    Resolved(bool, ResolutionPath),
    Failed {
        transactional: anyhow::Error,
        direct: anyhow::Error,
    },
}

/// Terminal outcome of a permission check.
#[derive(Debug)]
pub enum PermissionOutcome {
    Granted(ResolutionPath),
    Denied(ResolutionPath),
    /// Both paths errored.
    Failed {
        transactional: anyhow::Error,
        direct: anyhow::Error,
    },
}

impl PermissionOutcome {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Drives the transactional-then-direct resolution protocol.
#[derive(Clone)]
pub struct PermissionChecker {
    resolver: Arc<dyn PermissionResolver>,
}

impl PermissionChecker {
    #[must_use]
    pub fn new(resolver: Arc<dyn PermissionResolver>) -> Self {
        Self { resolver }
    }

    /// Transactional path only, relying on `ctx` being active.
    ///
    /// # Errors
    ///
    /// Propagates the resolver's error.
    pub async fn check_transactional(
        &self,
        ctx: &ActiveContext,
        permission: &str,
    ) -> anyhow::Result<bool> {
        self.resolver.check_transactional(ctx, permission).await
    }

    /// Direct (stateless) path only.
    ///
    /// # Errors
    ///
    /// Propagates the resolver's error.
    pub async fn check_direct(&self, ctx: &ActiveContext, permission: &str) -> anyhow::Result<bool> {
        self.resolver
            .check_direct(&ctx.user_id, &ctx.org_id, permission)
            .await
    }

    /// Runs the full state machine for `permission` under `ctx`.
    pub async fn check(&self, ctx: &ActiveContext, permission: &str) -> PermissionOutcome {
        let mut state = CheckState::Start;
        loop {
            state = match state {
                CheckState::Start => CheckState::TryTransactional,
                CheckState::TryTransactional => {
                    match self.check_transactional(ctx, permission).await {
                        Ok(allowed) => CheckState::Resolved(allowed, ResolutionPath::Transactional),
                        Err(e) => CheckState::TransactionalError(e),
                    }
                }
                CheckState::TransactionalError(e) => {
                    warn!(
                        permission,
                        user_id = %ctx.user_id,
                        org_id = %ctx.org_id,
                        error = ?e,
                        "transactional permission check failed; falling back to direct check"
                    );
                    CheckState::TryDirect(e)
                }
                CheckState::TryDirect(transactional) => {
                    match self.check_direct(ctx, permission).await {
                        Ok(allowed) => CheckState::Resolved(allowed, ResolutionPath::Direct),
                        Err(direct) => CheckState::Failed {
                            transactional,
                            direct,
                        },
                    }
                }
                CheckState::Resolved(allowed, path) => {
                    debug!(permission, allowed, ?path, "permission resolved");
                    return if allowed {
                        PermissionOutcome::Granted(path)
                    } else {
                        PermissionOutcome::Denied(path)
                    };
                }
                CheckState::Failed {
                    transactional,
                    direct,
                } => {
                    return PermissionOutcome::Failed {
                        transactional,
                        direct,
                    };
                }
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
