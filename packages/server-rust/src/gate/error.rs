//! Gate rejection taxonomy.
//!
//! Every early exit of the pipeline is a [`GateError`]. Each variant maps to
//! a coarse [`ErrorKind`] (the audit/logging category), a stable machine
//! code, and an HTTP status. Client-caused kinds are safe to describe to the
//! caller; infrastructure kinds are only ever described generically.

use http::StatusCode;
use tenantgate_core::{OrgId, UserId};

use super::context_store::ContextError;
use super::rate_limit::{RateLimitError, RateLimitExceeded};
use super::scope::ScopeError;

/// Role a route may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredRole {
    /// Organization admin (or owner, or super admin).
    Admin,
    /// Platform-wide super admin.
    SuperAdmin,
}

impl RequiredRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }
}

/// Coarse rejection category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthenticated,
    NoOrganization,
    InvalidTenant,
    ContextConflict,
    ContextVerificationFailed,
    RateLimited,
    Forbidden,
    PermissionCheckFailed,
    InternalError,
}

impl ErrorKind {
    /// Whether the caller caused the rejection (logged as a warning) rather
    /// than the infrastructure (logged as an error).
    #[must_use]
    pub fn is_client_caused(self) -> bool {
        matches!(
            self,
            Self::Unauthenticated | Self::NoOrganization | Self::RateLimited | Self::Forbidden
        )
    }
}

/// Why a request did not reach its handler, or why the handler failed.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("request is not authenticated")]
    Unauthenticated,

    #[error("no organization could be resolved for user {user_id}")]
    NoOrganization { user_id: UserId },

    #[error("user {user_id} is not a member of organization {org_id}")]
    OrgAccessDenied { user_id: UserId, org_id: OrgId },

    #[error("user {user_id} lacks role {} in organization {org_id}", required.as_str())]
    InsufficientRole {
        user_id: UserId,
        org_id: OrgId,
        required: RequiredRole,
    },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("rate limit exceeded on limiter {}", .0.limiter)]
    RateLimited(RateLimitExceeded),

    #[error(transparent)]
    RateLimiterUnavailable(#[from] RateLimitError),

    #[error("permission {permission:?} denied")]
    Forbidden { permission: String },

    #[error("permission {permission:?} could not be resolved: transactional: {transactional:#}; direct: {direct:#}")]
    PermissionCheckFailed {
        permission: String,
        transactional: anyhow::Error,
        direct: anyhow::Error,
    },

    #[error("tenant scope unavailable")]
    ScopeUnavailable(#[from] ScopeError),

    #[error("directory lookup failed")]
    Directory(#[source] anyhow::Error),

    #[error("handler timed out after {timeout_ms}ms")]
    HandlerTimeout { timeout_ms: u64 },

    #[error("handler panicked: {message}")]
    HandlerPanicked { message: String },

    #[error("handler failed")]
    Handler(#[source] anyhow::Error),
}

impl GateError {
    /// Coarse category used for logging severity.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::NoOrganization { .. } => ErrorKind::NoOrganization,
            Self::OrgAccessDenied { .. } | Self::InsufficientRole { .. } | Self::Forbidden { .. } => {
                ErrorKind::Forbidden
            }
            Self::Context(ContextError::InvalidTenant { .. }) => ErrorKind::InvalidTenant,
            Self::Context(ContextError::Conflict { .. }) => ErrorKind::ContextConflict,
            Self::Context(ContextError::VerificationFailed { .. }) => {
                ErrorKind::ContextVerificationFailed
            }
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::PermissionCheckFailed { .. } => ErrorKind::PermissionCheckFailed,
            Self::Context(ContextError::Backend { .. })
            | Self::RateLimiterUnavailable(_)
            | Self::ScopeUnavailable(_)
            | Self::Directory(_)
            | Self::HandlerTimeout { .. }
            | Self::HandlerPanicked { .. }
            | Self::Handler(_) => ErrorKind::InternalError,
        }
    }

    /// Stable machine-readable code. Never localized, never changes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::NoOrganization { .. } => "NO_ORGANIZATION",
            Self::OrgAccessDenied { .. } => "ORG_ACCESS_DENIED",
            Self::InsufficientRole { .. } => "INSUFFICIENT_ROLE",
            Self::Context(ContextError::InvalidTenant { .. }) => "INVALID_TENANT",
            Self::Context(ContextError::Conflict { .. }) => "CONTEXT_CONFLICT",
            Self::Context(ContextError::VerificationFailed { .. }) => "CONTEXT_VERIFICATION_FAILED",
            Self::Context(ContextError::Backend { .. }) => "CONTEXT_ERROR",
            Self::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            Self::RateLimiterUnavailable(_) => "RATE_LIMITER_UNAVAILABLE",
            Self::Forbidden { .. } => "PERMISSION_DENIED",
            Self::PermissionCheckFailed { .. } => "PERMISSION_CHECK_FAILED",
            Self::ScopeUnavailable(_) => "SCOPE_UNAVAILABLE",
            Self::HandlerTimeout { .. } => "HANDLER_TIMEOUT",
            Self::Directory(_) | Self::HandlerPanicked { .. } | Self::Handler(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status. `missing_org` is the gate's policy for `NoOrganization`.
    #[must_use]
    pub fn status(&self, missing_org: StatusCode) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NoOrganization { .. } => missing_org,
            Self::OrgAccessDenied { .. } | Self::InsufficientRole { .. } | Self::Forbidden { .. } => {
                StatusCode::FORBIDDEN
            }
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::RateLimiterUnavailable(_) | Self::ScopeUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::HandlerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Context(_)
            | Self::PermissionCheckFailed { .. }
            | Self::Directory(_)
            | Self::HandlerPanicked { .. }
            | Self::Handler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
