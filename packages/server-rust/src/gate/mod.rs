//! The tenant gate: context isolation, rate limiting, authorization and
//! response shaping for every inbound request.

pub mod config;
pub mod context_store;
pub mod error;
pub mod layer;
pub mod memory;
pub mod permission;
pub mod pipeline;
pub mod rate_limit;
pub mod response;
pub mod scope;
pub mod sweeper;

pub use config::{FailurePolicy, GateConfig, LimitScope, LimiterConfig, MissingOrgPolicy, WindowLimit};
pub use context_store::{ContextError, ContextGuard, TenantContextStore};
pub use error::{ErrorKind, GateError, RequiredRole};
pub use layer::{Admitted, GateLayer, GateService};
pub use memory::{MemoryContextBackend, MemoryDirectory};
pub use permission::{PermissionChecker, PermissionOutcome, ResolutionPath};
pub use pipeline::{Gated, RequestGate, RoutePolicy};
pub use rate_limit::{
    MemoryRateCounter, RateDecision, RateLimitError, RateLimitExceeded, RateLimitSnapshot,
    RateLimiter, RateSubject,
};
pub use response::{rate_limit_headers, Envelope, Locale, ResponseShaper, ShapedResponse};
pub use scope::{ScopeAllocator, ScopeError, ScopeLease, ScopeStrategy};
pub use sweeper::{BackgroundRunnable, BackgroundWorker, CounterSweeper, SweepTask};
