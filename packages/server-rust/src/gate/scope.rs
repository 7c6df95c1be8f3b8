//! Backing-store scope allocation.
//!
//! A scope is the unit of tenant-context isolation: one database session or
//! one pooled connection. Two strategies are supported:
//!
//! - **Per-request**: every request gets a fresh scope id that is never
//!   reused, so no other request can observe its context at all.
//! - **Pooled**: a fixed set of scope ids backed by a semaphore. A request
//!   checks one out, keeps it for its whole lifetime, and returns it on drop
//!   of the lease (checkout -> set -> ... -> clear -> checkin).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tenantgate_core::ScopeId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// How scopes are handed out to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStrategy {
    /// A fresh, never-reused scope per request.
    PerRequest,
    /// A bounded pool of reusable scopes.
    Pooled { size: u32 },
}

/// Errors from checking out a scope.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("no tenant scope became available within {waited_ms}ms")]
    Exhausted { waited_ms: u64 },
}

// ---------------------------------------------------------------------------
// ScopeAllocator
// ---------------------------------------------------------------------------

/// Hands out scopes according to a [`ScopeStrategy`].
#[derive(Debug)]
pub struct ScopeAllocator {
    kind: AllocatorKind,
    in_use: Arc<AtomicU64>,
}

#[derive(Debug)]
enum AllocatorKind {
    PerRequest { next_id: AtomicU64 },
    Pooled(Arc<ScopePool>),
}

#[derive(Debug)]
struct ScopePool {
    permits: Arc<Semaphore>,
    /// Free scopes, reused LIFO so a quiet system keeps hitting the same
    /// connection.
    free: Mutex<Vec<ScopeId>>,
}

impl ScopeAllocator {
    /// Creates an allocator for `strategy`. Scope ids start at 1.
    #[must_use]
    pub fn new(strategy: ScopeStrategy) -> Self {
        let kind = match strategy {
            ScopeStrategy::PerRequest => AllocatorKind::PerRequest {
                next_id: AtomicU64::new(1),
            },
            ScopeStrategy::Pooled { size } => {
                let free = (1..=u64::from(size)).rev().map(ScopeId).collect();
                AllocatorKind::Pooled(Arc::new(ScopePool {
                    permits: Arc::new(Semaphore::new(size as usize)),
                    free: Mutex::new(free),
                }))
            }
        };
        Self {
            kind,
            in_use: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Checks out a scope, waiting up to `timeout` when the pool is empty.
    ///
    /// # Errors
    ///
    /// Returns `ScopeError::Exhausted` if no pooled scope is released in time.
    pub async fn checkout(&self, timeout: Duration) -> Result<ScopeLease, ScopeError> {
        let (scope, slot) = match &self.kind {
            AllocatorKind::PerRequest { next_id } => {
                (ScopeId(next_id.fetch_add(1, Ordering::Relaxed)), None)
            }
            AllocatorKind::Pooled(pool) => {
                let acquire = Arc::clone(&pool.permits).acquire_owned();
                let permit = match tokio::time::timeout(timeout, acquire).await {
                    Ok(Ok(permit)) => permit,
                    // The semaphore is never closed; treat closure like exhaustion.
                    Ok(Err(_)) | Err(_) => {
                        #[allow(clippy::cast_possible_truncation)]
                        let waited_ms = timeout.as_millis() as u64;
                        return Err(ScopeError::Exhausted { waited_ms });
                    }
                };
                // A held permit guarantees a free scope exists.
                let Some(scope) = pool.free.lock().pop() else {
                    return Err(ScopeError::Exhausted { waited_ms: 0 });
                };
                (
                    scope,
                    Some(PooledSlot {
                        pool: Arc::clone(pool),
                        _permit: permit,
                    }),
                )
            }
        };

        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(ScopeLease {
            scope,
            slot,
            in_use: Arc::clone(&self.in_use),
        })
    }

    /// Number of scopes currently checked out.
    #[must_use]
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ScopeLease
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PooledSlot {
    pool: Arc<ScopePool>,
    _permit: OwnedSemaphorePermit,
}

/// RAII lease on a scope. Dropping it checks the scope back in.
///
/// The scope is pushed back onto the free list before the permit is
/// released, so a waiter woken by the permit always finds a free scope.
#[derive(Debug)]
pub struct ScopeLease {
    scope: ScopeId,
    slot: Option<PooledSlot>,
    in_use: Arc<AtomicU64>,
}

impl ScopeLease {
    /// The leased scope.
    #[must_use]
    pub fn scope(&self) -> ScopeId {
        self.scope
    }
}

impl Drop for ScopeLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.pool.free.lock().push(self.scope);
            drop(slot);
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn per_request_scopes_are_never_reused() {
        let alloc = ScopeAllocator::new(ScopeStrategy::PerRequest);
        let a = alloc.checkout(WAIT).await.unwrap();
        let first = a.scope();
        drop(a);
        let b = alloc.checkout(WAIT).await.unwrap();
        assert_ne!(first, b.scope());
    }

    #[tokio::test]
    async fn pooled_scope_is_reused_after_checkin() {
        let alloc = ScopeAllocator::new(ScopeStrategy::Pooled { size: 1 });
        let a = alloc.checkout(WAIT).await.unwrap();
        let first = a.scope();
        drop(a);
        let b = alloc.checkout(WAIT).await.unwrap();
        assert_eq!(first, b.scope());
    }

    #[tokio::test]
    async fn pooled_scopes_are_distinct_while_checked_out() {
        let alloc = ScopeAllocator::new(ScopeStrategy::Pooled { size: 2 });
        let a = alloc.checkout(WAIT).await.unwrap();
        let b = alloc.checkout(WAIT).await.unwrap();
        assert_ne!(a.scope(), b.scope());
        assert_eq!(alloc.in_use(), 2);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let alloc = ScopeAllocator::new(ScopeStrategy::Pooled { size: 1 });
        let _held = alloc.checkout(WAIT).await.unwrap();
        let err = alloc.checkout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ScopeError::Exhausted { waited_ms: 20 }));
    }

    #[tokio::test]
    async fn waiter_gets_scope_once_released() {
        let alloc = Arc::new(ScopeAllocator::new(ScopeStrategy::Pooled { size: 1 }));
        let held = alloc.checkout(WAIT).await.unwrap();
        let scope = held.scope();

        let waiter = tokio::spawn({
            let alloc = Arc::clone(&alloc);
            async move { alloc.checkout(Duration::from_secs(2)).await.map(|l| l.scope()) }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), scope);
    }

    #[tokio::test]
    async fn in_use_tracks_leases() {
        let alloc = ScopeAllocator::new(ScopeStrategy::PerRequest);
        assert_eq!(alloc.in_use(), 0);
        let a = alloc.checkout(WAIT).await.unwrap();
        let b = alloc.checkout(WAIT).await.unwrap();
        assert_eq!(alloc.in_use(), 2);
        drop(a);
        assert_eq!(alloc.in_use(), 1);
        drop(b);
        assert_eq!(alloc.in_use(), 0);
    }
}
