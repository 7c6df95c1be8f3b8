//! Tenant context store: sets, reads and clears the (user, org) pair that
//! row-level security policies read from the backing session.
//!
//! The store is stateless across requests; every call goes to the backend.
//! [`ContextGuard`] ties a context to a [`ScopeLease`] and guarantees the
//! context is cleared exactly once, including when the request future is
//! dropped mid-flight.

use std::sync::Arc;

use tenantgate_core::{ActiveContext, ContextBackend, OrgId, ScopeId, UserId};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::scope::ScopeLease;

/// Session key holding the active user id.
pub const USER_KEY: &str = "app.current_user_id";
/// Session key holding the active organization id.
pub const ORG_KEY: &str = "app.current_org_id";

/// Failures while establishing tenant context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("invalid tenant id {value:?}: not a UUID")]
    InvalidTenant { value: String },

    #[error("tenant context already active on {scope} (org {active_org:?}); refusing to overwrite")]
    Conflict {
        scope: ScopeId,
        active_org: Option<String>,
    },

    #[error("tenant context verification failed on {scope}: wrote {key}={expected}, read back {observed:?}")]
    VerificationFailed {
        scope: ScopeId,
        key: &'static str,
        expected: String,
        observed: Option<String>,
    },

    #[error("context backend failure on {scope}")]
    Backend {
        scope: ScopeId,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// TenantContextStore
// ---------------------------------------------------------------------------

/// Number of write locks shared between all scopes.
const WRITE_STRIPES: u64 = 64;

/// Set/get/clear operations on the backing context store.
///
/// Writes to the same scope are serialized through a fixed set of striped
/// locks, so the vacancy check and the write behave as one step for
/// concurrent callers on one store.
#[derive(Clone)]
pub struct TenantContextStore {
    backend: Arc<dyn ContextBackend>,
    stripes: Arc<[Mutex<()>]>,
}

impl TenantContextStore {
    #[must_use]
    pub fn new(backend: Arc<dyn ContextBackend>) -> Self {
        Self {
            backend,
            stripes: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Sets the tenant context on `scope`.
    ///
    /// Validates `org` as a UUID, refuses to overwrite an active context,
    /// writes both keys and reads them back. Of two concurrent calls on the
    /// same scope, the second sees the first's context and fails with
    /// `Conflict`.
    ///
    /// # Errors
    ///
    /// `InvalidTenant`, `Conflict`, `VerificationFailed`, or `Backend`.
    pub async fn set_context(
        &self,
        scope: ScopeId,
        user: &UserId,
        org: &str,
    ) -> Result<ActiveContext, ContextError> {
        let mut written = false;
        self.set_exclusive(scope, user, org, &mut written).await
    }

    /// Reads the active context on `scope` without mutating it.
    ///
    /// Returns `None` unless both keys are present and the org parses.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::Backend` if the backend read fails.
    pub async fn get_context(
        &self,
        scope: ScopeId,
    ) -> Result<Option<(UserId, OrgId)>, ContextError> {
        let user = self.read(scope, USER_KEY).await?;
        let org = self.read(scope, ORG_KEY).await?;
        Ok(match (user, org) {
            (Some(user), Some(org)) => OrgId::parse(&org).ok().map(|org| (UserId::from(user), org)),
            _ => None,
        })
    }

    /// Clears the context on `scope`. Idempotent.
    ///
    /// Backend failures are logged and swallowed: cleanup never decides the
    /// response.
    pub async fn clear_context(&self, scope: ScopeId) {
        match self.backend.clear(scope).await {
            Ok(()) => debug!(%scope, "tenant context cleared"),
            Err(e) => error!(%scope, error = ?e, "failed to clear tenant context"),
        }
    }

    /// Wraps `lease` in a guard that clears the scope once context was written.
    #[must_use]
    pub fn guard(&self, lease: ScopeLease) -> ContextGuard {
        ContextGuard {
            store: self.clone(),
            lease: Some(lease),
            armed: false,
        }
    }

    fn validate_org(org: &str) -> Result<OrgId, ContextError> {
        OrgId::parse(org).map_err(|e| ContextError::InvalidTenant { value: e.value })
    }

    /// Check-and-write under the scope's stripe lock. `written` flips to
    /// true right before the first backend write.
    async fn set_exclusive(
        &self,
        scope: ScopeId,
        user: &UserId,
        org: &str,
        written: &mut bool,
    ) -> Result<ActiveContext, ContextError> {
        let org_id = Self::validate_org(org)?;
        let _write = self.stripe(scope).lock().await;
        self.ensure_vacant(scope).await?;
        *written = true;
        self.write_and_verify(scope, user, org_id).await
    }

    fn stripe(&self, scope: ScopeId) -> &Mutex<()> {
        let index = usize::try_from(scope.0 % WRITE_STRIPES).unwrap_or(0);
        &self.stripes[index]
    }

    async fn ensure_vacant(&self, scope: ScopeId) -> Result<(), ContextError> {
        let user = self.read(scope, USER_KEY).await?;
        let org = self.read(scope, ORG_KEY).await?;
        if user.is_some() || org.is_some() {
            warn!(%scope, active_org = ?org, "tenant context already active");
            return Err(ContextError::Conflict {
                scope,
                active_org: org,
            });
        }
        Ok(())
    }

    async fn write_and_verify(
        &self,
        scope: ScopeId,
        user: &UserId,
        org_id: OrgId,
    ) -> Result<ActiveContext, ContextError> {
        let org_text = org_id.to_string();
        for (key, value) in [(USER_KEY, user.as_str()), (ORG_KEY, org_text.as_str())] {
            self.backend
                .set(scope, key, value)
                .await
                .map_err(|source| ContextError::Backend { scope, source })?;
        }
        for (key, expected) in [(USER_KEY, user.as_str()), (ORG_KEY, org_text.as_str())] {
            let observed = self.read(scope, key).await?;
            if observed.as_deref() != Some(expected) {
                return Err(ContextError::VerificationFailed {
                    scope,
                    key,
                    expected: expected.to_string(),
                    observed,
                });
            }
        }
        debug!(%scope, user_id = %user, org_id = %org_id, "tenant context set");
        Ok(ActiveContext {
            scope,
            user_id: user.clone(),
            org_id,
        })
    }

    async fn read(&self, scope: ScopeId, key: &str) -> Result<Option<String>, ContextError> {
        self.backend
            .get(scope, key)
            .await
            .map_err(|source| ContextError::Backend { scope, source })
    }
}

// ---------------------------------------------------------------------------
// ContextGuard
// ---------------------------------------------------------------------------

/// Owns a scope lease for one request and clears its context exactly once.
///
/// The guard arms itself immediately before the first backend write, so a
/// request rejected before writing (invalid tenant, conflict) never clears a
/// context it does not own. Call [`ContextGuard::release`] on every normal
/// exit path; if the guard is dropped while armed (request cancelled, task
/// aborted) the clear is spawned onto the runtime instead.
pub struct ContextGuard {
    store: TenantContextStore,
    lease: Option<ScopeLease>,
    armed: bool,
}

impl ContextGuard {
    /// The scope this guard owns.
    #[must_use]
    pub fn scope(&self) -> Option<ScopeId> {
        self.lease.as_ref().map(ScopeLease::scope)
    }

    /// Sets the tenant context on the guarded scope.
    ///
    /// # Errors
    ///
    /// Same as [`TenantContextStore::set_context`].
    pub async fn set(&mut self, user: &UserId, org: &str) -> Result<ActiveContext, ContextError> {
        let Some(scope) = self.scope() else {
            return Err(ContextError::Backend {
                scope: ScopeId(0),
                source: anyhow::anyhow!("context guard already released"),
            });
        };
        self.store
            .set_exclusive(scope, user, org, &mut self.armed)
            .await
    }

    /// Whether this guard wrote to its scope and still owes a clear.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Clears the context (if written) and checks the scope back in.
    pub async fn release(mut self) {
        if self.armed {
            if let Some(scope) = self.scope() {
                self.store.clear_context(scope).await;
            }
            self.armed = false;
        }
        self.lease.take();
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(lease) = self.lease.take() else {
            return;
        };
        let store = self.store.clone();
        let scope = lease.scope();
        warn!(%scope, "request dropped with tenant context active; clearing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // The lease moves into the task so the scope is not checked
                // back in until the clear has finished.
                handle.spawn(async move {
                    store.clear_context(scope).await;
                    drop(lease);
                });
            }
            Err(_) => {
                error!(%scope, "no runtime available to clear tenant context; scope leaked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::gate::memory::MemoryContextBackend;
    use crate::gate::scope::{ScopeAllocator, ScopeStrategy};

    const ORG_A: &str = "11111111-1111-1111-1111-111111111111";
    const ORG_B: &str = "22222222-2222-2222-2222-222222222222";

    fn store() -> (TenantContextStore, Arc<MemoryContextBackend>) {
        let backend = Arc::new(MemoryContextBackend::tracking());
        (TenantContextStore::new(backend.clone()), backend)
    }

    /// Backend that rewrites every org value it stores.
    struct TamperingBackend(MemoryContextBackend);

    #[async_trait]
    impl ContextBackend for TamperingBackend {
        async fn set(&self, scope: ScopeId, key: &str, value: &str) -> anyhow::Result<()> {
            let value = if key == ORG_KEY { ORG_B } else { value };
            self.0.set(scope, key, value).await
        }
        async fn get(&self, scope: ScopeId, key: &str) -> anyhow::Result<Option<String>> {
            self.0.get(scope, key).await
        }
        async fn clear(&self, scope: ScopeId) -> anyhow::Result<()> {
            self.0.clear(scope).await
        }
    }

    /// Backend that yields to the scheduler around every call.
    struct YieldingBackend(MemoryContextBackend);

    #[async_trait]
    impl ContextBackend for YieldingBackend {
        async fn set(&self, scope: ScopeId, key: &str, value: &str) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.0.set(scope, key, value).await
        }
        async fn get(&self, scope: ScopeId, key: &str) -> anyhow::Result<Option<String>> {
            tokio::task::yield_now().await;
            self.0.get(scope, key).await
        }
        async fn clear(&self, scope: ScopeId) -> anyhow::Result<()> {
            self.0.clear(scope).await
        }
    }

    /// Backend whose connection is gone.
    struct ClosedBackend {
        clears: AtomicU32,
    }

    #[async_trait]
    impl ContextBackend for ClosedBackend {
        async fn set(&self, _: ScopeId, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection closed")
        }
        async fn get(&self, _: ScopeId, _: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn clear(&self, _: ScopeId) -> anyhow::Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("connection closed")
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (store, _) = store();
        let ctx = store.set_context(ScopeId(1), &"u1".into(), ORG_A).await.unwrap();
        assert_eq!(ctx.org_id.to_string(), ORG_A);

        let (user, org) = store.get_context(ScopeId(1)).await.unwrap().unwrap();
        assert_eq!(user.as_str(), "u1");
        assert_eq!(org.to_string(), ORG_A);
    }

    #[tokio::test]
    async fn invalid_org_is_rejected_without_writing() {
        let (store, backend) = store();
        let err = store
            .set_context(ScopeId(1), &"u1".into(), "acme")
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidTenant { value } if value == "acme"));
        assert!(backend.is_empty(ScopeId(1)));
    }

    #[tokio::test]
    async fn second_set_conflicts_and_keeps_first_context() {
        let (store, _) = store();
        store.set_context(ScopeId(1), &"u1".into(), ORG_A).await.unwrap();

        let err = store
            .set_context(ScopeId(1), &"u2".into(), ORG_B)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Conflict { active_org: Some(ref o), .. } if o == ORG_A));

        let (user, org) = store.get_context(ScopeId(1)).await.unwrap().unwrap();
        assert_eq!(user.as_str(), "u1");
        assert_eq!(org.to_string(), ORG_A);
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let (store, _) = store();
        store.set_context(ScopeId(1), &"u1".into(), ORG_A).await.unwrap();
        store.set_context(ScopeId(2), &"u2".into(), ORG_B).await.unwrap();

        let (_, org1) = store.get_context(ScopeId(1)).await.unwrap().unwrap();
        let (_, org2) = store.get_context(ScopeId(2)).await.unwrap().unwrap();
        assert_eq!(org1.to_string(), ORG_A);
        assert_eq!(org2.to_string(), ORG_B);
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let (store, _) = store();
        store.set_context(ScopeId(1), &"u1".into(), ORG_A).await.unwrap();
        store.clear_context(ScopeId(1)).await;
        store.clear_context(ScopeId(1)).await;
        assert!(store.get_context(ScopeId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_after_clear_succeeds() {
        let (store, _) = store();
        store.set_context(ScopeId(1), &"u1".into(), ORG_A).await.unwrap();
        store.clear_context(ScopeId(1)).await;
        let ctx = store.set_context(ScopeId(1), &"u2".into(), ORG_B).await.unwrap();
        assert_eq!(ctx.user_id.as_str(), "u2");
    }

    #[tokio::test]
    async fn read_back_mismatch_fails_verification() {
        let store = TenantContextStore::new(Arc::new(TamperingBackend(MemoryContextBackend::new())));
        let err = store
            .set_context(ScopeId(1), &"u1".into(), ORG_A)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContextError::VerificationFailed { key: ORG_KEY, ref observed, .. }
                if observed.as_deref() == Some(ORG_B)
        ));
    }

    #[tokio::test]
    async fn clear_failure_is_swallowed() {
        let backend = Arc::new(ClosedBackend {
            clears: AtomicU32::new(0),
        });
        let store = TenantContextStore::new(backend.clone());
        store.clear_context(ScopeId(1)).await;
        assert_eq!(backend.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_write_failure_is_reported() {
        let backend = Arc::new(ClosedBackend {
            clears: AtomicU32::new(0),
        });
        let store = TenantContextStore::new(backend);
        let err = store
            .set_context(ScopeId(1), &"u1".into(), ORG_A)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Backend { .. }));
    }

    #[tokio::test]
    async fn guard_release_clears_written_context() {
        let (store, backend) = store();
        let alloc = ScopeAllocator::new(ScopeStrategy::PerRequest);
        let mut guard = store.guard(alloc.checkout(Duration::from_secs(1)).await.unwrap());
        let scope = guard.scope().unwrap();

        guard.set(&"u1".into(), ORG_A).await.unwrap();
        assert!(guard.is_armed());
        guard.release().await;

        assert!(backend.is_empty(scope));
        assert_eq!(backend.clear_count(scope), Some(1));
        assert_eq!(alloc.in_use(), 0);
    }

    #[tokio::test]
    async fn guard_does_not_clear_a_context_it_did_not_write() {
        let (store, backend) = store();
        store.set_context(ScopeId(1), &"u1".into(), ORG_A).await.unwrap();

        let alloc = ScopeAllocator::new(ScopeStrategy::Pooled { size: 1 });
        let mut guard = store.guard(alloc.checkout(Duration::from_secs(1)).await.unwrap());
        assert_eq!(guard.scope(), Some(ScopeId(1)));

        let err = guard.set(&"u2".into(), ORG_B).await.unwrap_err();
        assert!(matches!(err, ContextError::Conflict { .. }));
        assert!(!guard.is_armed());
        guard.release().await;

        assert_eq!(backend.clear_count(ScopeId(1)), Some(0));
        let (user, _) = store.get_context(ScopeId(1)).await.unwrap().unwrap();
        assert_eq!(user.as_str(), "u1");
    }

    #[tokio::test]
    async fn dropped_guard_clears_in_background() {
        let (store, backend) = store();
        let alloc = ScopeAllocator::new(ScopeStrategy::PerRequest);
        let mut guard = store.guard(alloc.checkout(Duration::from_secs(1)).await.unwrap());
        let scope = guard.scope().unwrap();
        guard.set(&"u1".into(), ORG_A).await.unwrap();

        drop(guard);
        for _ in 0..50 {
            if backend.clear_count(scope) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(backend.clear_count(scope), Some(1));
        assert!(backend.is_empty(scope));
        assert_eq!(alloc.in_use(), 0);
    }

    #[tokio::test]
    async fn guard_clears_after_failed_verification() {
        let backend = Arc::new(TamperingBackend(MemoryContextBackend::tracking()));
        let store = TenantContextStore::new(backend.clone());
        let alloc = ScopeAllocator::new(ScopeStrategy::Pooled { size: 1 });
        let mut guard = store.guard(alloc.checkout(Duration::from_secs(1)).await.unwrap());
        let scope = guard.scope().unwrap();

        let err = guard.set(&"u1".into(), ORG_A).await.unwrap_err();
        assert!(matches!(err, ContextError::VerificationFailed { .. }));
        assert!(guard.is_armed());
        guard.release().await;

        assert!(backend.0.is_empty(scope));
        assert_eq!(backend.0.clear_count(scope), Some(1));
        assert_eq!(alloc.in_use(), 0);
    }

    #[tokio::test]
    async fn guard_clears_after_failed_write() {
        let backend = Arc::new(ClosedBackend {
            clears: AtomicU32::new(0),
        });
        let store = TenantContextStore::new(backend.clone());
        let alloc = ScopeAllocator::new(ScopeStrategy::PerRequest);
        let mut guard = store.guard(alloc.checkout(Duration::from_secs(1)).await.unwrap());

        let err = guard.set(&"u1".into(), ORG_A).await.unwrap_err();
        assert!(matches!(err, ContextError::Backend { .. }));
        assert!(guard.is_armed());
        guard.release().await;

        assert_eq!(backend.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_sets_on_one_scope_leave_a_single_context() {
        let backend = Arc::new(YieldingBackend(MemoryContextBackend::new()));
        let store = TenantContextStore::new(backend);
        let (u1, u2) = (UserId::from("u1"), UserId::from("u2"));

        let (first, second) = tokio::join!(
            store.set_context(ScopeId(7), &u1, ORG_A),
            store.set_context(ScopeId(7), &u2, ORG_B),
        );

        let winner = match (first, second) {
            (Ok(ctx), Err(ContextError::Conflict { .. }))
            | (Err(ContextError::Conflict { .. }), Ok(ctx)) => ctx,
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        let (user, org) = store.get_context(ScopeId(7)).await.unwrap().unwrap();
        assert_eq!(user, winner.user_id);
        assert_eq!(org, winner.org_id);
    }
}
