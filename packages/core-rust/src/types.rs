use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of an authenticated user.
///
/// The gate never interprets the value; it is compared, logged, and written
/// to the backing context store as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Error returned when an organization identifier is not a well-formed UUID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("organization id is not a valid UUID: {value:?}")]
pub struct InvalidOrgId {
    /// The rejected input, kept for diagnostics.
    pub value: String,
}

/// Identifier of a tenant organization. Always a syntactically valid UUID.
///
/// Validation is purely syntactic (8-4-4-4-12 hex groups); version and
/// variant bits are not checked because tenant ids issued by older
/// provisioning code do not always carry RFC 4122 variant bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(Uuid);

impl OrgId {
    /// Parses an organization id from its textual form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOrgId` if `value` is not a hyphenated UUID.
    pub fn parse(value: &str) -> Result<Self, InvalidOrgId> {
        let trimmed = value.trim();
        // Only the canonical hyphenated form is accepted; uuid also parses
        // simple, braced and urn forms which never appear in routes.
        if trimmed.len() != 36 {
            return Err(InvalidOrgId {
                value: value.to_string(),
            });
        }
        Uuid::parse_str(trimmed).map(Self).map_err(|_| InvalidOrgId {
            value: value.to_string(),
        })
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for OrgId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for OrgId {
    type Err = InvalidOrgId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of a backing-store scope (a database session / pooled connection).
///
/// At most one tenant context may be active per scope at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Subscription tier of an organization, used to scale rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
    /// Any plan name the gate does not recognize. Scales like `Free`.
    Unknown,
}

impl Tier {
    /// Rate-limit multiplier applied to a limiter's base limit.
    #[must_use]
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Free | Self::Unknown => 1.0,
            Self::Pro => 2.0,
            Self::Enterprise => 5.0,
        }
    }

    /// Maps a subscription plan name to a tier. Matching is case-insensitive.
    #[must_use]
    pub fn from_plan(plan: &str) -> Self {
        match plan.trim().to_ascii_lowercase().as_str() {
            "free" => Self::Free,
            "pro" => Self::Pro,
            "enterprise" => Self::Enterprise,
            _ => Self::Unknown,
        }
    }

    /// Effective limit for this tier: `ceil(base * multiplier)`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn scale(self, base_limit: u64) -> u64 {
        (base_limit as f64 * self.multiplier()).ceil() as u64
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
            Self::Unknown => "unknown",
        }
    }
}

/// Role a user holds inside one organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgRole {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl OrgRole {
    /// Whether the role carries organization-admin privileges.
    #[must_use]
    pub fn is_admin(self) -> bool {
        self >= Self::Admin
    }
}

/// Where the organization id of a request was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgSource {
    /// Explicit route/path parameter.
    RouteParam,
    /// Session or request-scoped "current org".
    Session,
    /// The user's stored default/active organization.
    UserDefault,
}

impl OrgSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RouteParam => "route_param",
            Self::Session => "session",
            Self::UserDefault => "user_default",
        }
    }
}
