//! Fixed-window rate limiting.
//!
//! [`MemoryRateCounter`] is a [`RateCounter`] backed by `DashMap`; each key's
//! window is mutated under its shard lock, so concurrent hits never lose
//! updates. [`RateLimiter`] applies one [`LimiterConfig`]: identity keying,
//! tier scaling, ordered windows, and the limiter's failure policy.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tenantgate_core::{OrgId, RateCounter, Tier, UserId};
use tokio::time::Instant;
use tracing::warn;

use super::config::{FailurePolicy, LimitScope, LimiterConfig, WindowLimit};

// ---------------------------------------------------------------------------
// MemoryRateCounter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct CounterWindow {
    count: u64,
    resets_at: Instant,
}

impl CounterWindow {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.resets_at
    }
}

/// In-process fixed-window counter store.
#[derive(Debug, Default)]
pub struct MemoryRateCounter {
    windows: DashMap<String, CounterWindow>,
}

impl MemoryRateCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes expired windows. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked windows, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Whole seconds until `deadline`, rounded up.
fn secs_until(deadline: Instant, now: Instant) -> u64 {
    let left = deadline.saturating_duration_since(now);
    left.as_secs() + u64::from(left.subsec_nanos() > 0)
}

#[async_trait::async_trait]
impl RateCounter for MemoryRateCounter {
    async fn hit(&self, key: &str, window_secs: u64) -> anyhow::Result<u64> {
        let now = Instant::now();
        let window = Duration::from_secs(window_secs);
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| CounterWindow {
                count: 0,
                resets_at: now + window,
            });
        if entry.is_expired(now) {
            entry.count = 0;
            entry.resets_at = now + window;
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn attempts(&self, key: &str) -> anyhow::Result<u64> {
        let now = Instant::now();
        Ok(self
            .windows
            .get(key)
            .filter(|w| !w.is_expired(now))
            .map_or(0, |w| w.count))
    }

    async fn available_in(&self, key: &str) -> anyhow::Result<u64> {
        let now = Instant::now();
        Ok(self
            .windows
            .get(key)
            .filter(|w| !w.is_expired(now))
            .map_or(0, |w| secs_until(w.resets_at, now)))
    }

    async fn reset(&self, key: &str) -> anyhow::Result<()> {
        self.windows.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Who a request is counted against.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSubject<'a> {
    pub user: Option<&'a UserId>,
    pub ip: Option<IpAddr>,
    pub org: Option<&'a OrgId>,
}

/// Counter state of one window, reported in headers and envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    /// Effective (tier-scaled) limit.
    pub limit: u64,
    /// Requests left in the window, never negative.
    pub remaining: u64,
    /// Seconds until the window resets.
    pub reset_after: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

/// A rejected request: the first exceeded window and its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub limiter: String,
    pub snapshot: RateLimitSnapshot,
}

impl RateLimitExceeded {
    /// Seconds the caller should wait before retrying.
    #[must_use]
    pub fn retry_after(&self) -> u64 {
        self.snapshot.reset_after
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Within limits. Carries the first window's state, or `None` when the
    /// store was unreachable and the limiter fails open.
    Allowed(Option<RateLimitSnapshot>),
    Limited(RateLimitExceeded),
}

/// Counter store failure on a fail-closed limiter.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit store unavailable for limiter {limiter}")]
    StoreUnavailable {
        limiter: String,
        #[source]
        source: anyhow::Error,
    },
}

/// One configured limiter instance over a shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<LimiterConfig>,
    counter: Arc<dyn RateCounter>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: LimiterConfig, counter: Arc<dyn RateCounter>) -> Self {
        Self {
            config: Arc::new(config),
            counter,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Counter identity for `subject` under this limiter's scope.
    #[must_use]
    pub fn identity(&self, subject: &RateSubject<'_>) -> String {
        let ip = || subject.ip.map_or_else(|| "ip:unknown".to_string(), |ip| format!("ip:{ip}"));
        match self.config.scope {
            LimitScope::User => subject.user.map_or_else(ip, |u| format!("user:{u}")),
            LimitScope::Ip => ip(),
            LimitScope::Org => subject.org.map_or_else(ip, |o| format!("org:{o}")),
        }
    }

    /// Limit of `window` after tier scaling (when the limiter is tiered).
    #[must_use]
    pub fn effective_limit(&self, window: &WindowLimit, tier: Tier) -> u64 {
        if self.config.tiered {
            tier.scale(window.base_limit)
        } else {
            window.base_limit
        }
    }

    fn key(&self, identity: &str, window: &WindowLimit) -> String {
        format!("{}:{identity}:{}", self.config.name, window.window_secs)
    }

    /// Checks and consumes one request for `subject`.
    ///
    /// All windows are pre-checked before any is hit, so a request rejected
    /// by a later window does not consume quota in an earlier one. A hit that
    /// lands above the limit (lost race with a concurrent request) is also
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::StoreUnavailable` when the counter store fails
    /// and the limiter is fail-closed.
    pub async fn check(
        &self,
        subject: &RateSubject<'_>,
        tier: Tier,
    ) -> Result<RateDecision, RateLimitError> {
        match self.try_check(subject, tier).await {
            Ok(decision) => Ok(decision),
            Err(source) => match self.config.on_store_error {
                FailurePolicy::FailOpen => {
                    warn!(
                        limiter = %self.config.name,
                        error = ?source,
                        "rate limit store unavailable; failing open"
                    );
                    metrics::counter!("tenantgate_rate_limit_fail_open_total", "limiter" => self.config.name.clone())
                        .increment(1);
                    Ok(RateDecision::Allowed(None))
                }
                FailurePolicy::FailClosed => Err(RateLimitError::StoreUnavailable {
                    limiter: self.config.name.clone(),
                    source,
                }),
            },
        }
    }

    async fn try_check(
        &self,
        subject: &RateSubject<'_>,
        tier: Tier,
    ) -> anyhow::Result<RateDecision> {
        let identity = self.identity(subject);
        let windows: Vec<(String, u64, &WindowLimit)> = self
            .config
            .windows
            .iter()
            .map(|w| (self.key(&identity, w), self.effective_limit(w, tier), w))
            .collect();

        for (key, limit, window) in &windows {
            if self.counter.too_many_attempts(key, *limit).await? {
                return Ok(RateDecision::Limited(
                    self.exceeded(key, *limit, window).await?,
                ));
            }
        }

        let mut first = None;
        for (key, limit, window) in &windows {
            let count = self.counter.hit(key, window.window_secs).await?;
            if count > *limit {
                return Ok(RateDecision::Limited(
                    self.exceeded(key, *limit, window).await?,
                ));
            }
            if first.is_none() {
                first = Some(RateLimitSnapshot {
                    limit: *limit,
                    remaining: limit.saturating_sub(count),
                    reset_after: self.counter.available_in(key).await?,
                    window_secs: window.window_secs,
                });
            }
        }
        Ok(RateDecision::Allowed(first))
    }

    async fn exceeded(
        &self,
        key: &str,
        limit: u64,
        window: &WindowLimit,
    ) -> anyhow::Result<RateLimitExceeded> {
        Ok(RateLimitExceeded {
            limiter: self.config.name.clone(),
            snapshot: RateLimitSnapshot {
                limit,
                remaining: 0,
                reset_after: self.counter.available_in(key).await?,
                window_secs: window.window_secs,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
