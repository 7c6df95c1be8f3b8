//! Uniform result envelopes.
//!
//! [`ResponseShaper`] turns a [`GateError`] or a successful handler result
//! into a status code, rate-limit headers and a JSON [`Envelope`]. Codes are
//! stable and never localized; messages follow the caller's locale.
//! Infrastructure failures only ever carry a generic message unless the gate
//! runs in debug mode.

use std::error::Error as StdError;
use std::time::{SystemTime, UNIX_EPOCH};

use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};

use super::config::GateConfig;
use super::error::GateError;
use super::rate_limit::RateLimitSnapshot;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Message language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Ar,
}

impl Locale {
    /// Picks the first supported language from an `Accept-Language` value.
    ///
    /// Quality weights are ignored; order decides. Unknown or missing values
    /// fall back to English.
    #[must_use]
    pub fn from_accept_language(header: Option<&str>) -> Self {
        let Some(header) = header else {
            return Self::En;
        };
        for range in header.split(',') {
            let tag = range.split(';').next().unwrap_or_default().trim();
            let primary = tag.split('-').next().unwrap_or_default();
            if primary.eq_ignore_ascii_case("ar") {
                return Self::Ar;
            }
            if primary.eq_ignore_ascii_case("en") {
                return Self::En;
            }
        }
        Self::En
    }
}

/// JSON body returned to API callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

/// Status, headers and body for one outcome.
#[derive(Debug, Clone)]
pub struct ShapedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub envelope: Envelope,
}

/// Maps gate outcomes to envelopes.
#[derive(Debug, Clone)]
pub struct ResponseShaper {
    debug: bool,
    missing_org: StatusCode,
    admin_contact: Option<String>,
}

impl ResponseShaper {
    #[must_use]
    pub fn new(config: &GateConfig) -> Self {
        Self {
            debug: config.debug,
            missing_org: config.missing_org_policy.status(),
            admin_contact: config.admin_contact.clone(),
        }
    }

    /// Shapes a successful handler result.
    #[must_use]
    pub fn success(&self, data: Option<Value>, rate: Option<&RateLimitSnapshot>) -> ShapedResponse {
        let headers = rate.map(rate_limit_headers).unwrap_or_default();
        ShapedResponse {
            status: StatusCode::OK,
            headers,
            envelope: Envelope {
                success: true,
                data,
                error: None,
                message: None,
                retry_after: None,
                details: None,
            },
        }
    }

    /// Shapes a rejection.
    #[must_use]
    pub fn reject(&self, err: &GateError, locale: Locale) -> ShapedResponse {
        let mut headers = HeaderMap::new();
        let mut details = Map::new();
        let mut retry_after = None;

        match err {
            GateError::RateLimited(exceeded) => {
                headers = rate_limit_headers(&exceeded.snapshot);
                headers.insert(RETRY_AFTER, HeaderValue::from(exceeded.retry_after()));
                retry_after = Some(exceeded.retry_after());
                details.insert("limit".into(), exceeded.snapshot.limit.into());
                details.insert("remaining".into(), exceeded.snapshot.remaining.into());
                details.insert("window_secs".into(), exceeded.snapshot.window_secs.into());
            }
            GateError::OrgAccessDenied { .. } => {
                if let Some(contact) = &self.admin_contact {
                    details.insert("admin_contact".into(), contact.clone().into());
                }
            }
            GateError::InsufficientRole { required, .. } => {
                details.insert("required_role".into(), required.as_str().into());
            }
            GateError::Forbidden { permission } => {
                details.insert("required_permission".into(), permission.clone().into());
            }
            _ => {}
        }

        if self.debug {
            details.insert("debug".into(), error_chain(err).into());
        }

        ShapedResponse {
            status: err.status(self.missing_org),
            headers,
            envelope: Envelope {
                success: false,
                data: None,
                error: Some(err.code()),
                message: Some(message(err, locale)),
                retry_after,
                details: (!details.is_empty()).then_some(details),
            },
        }
    }
}

/// `X-RateLimit-*` headers for `snapshot`. The reset header is a Unix
/// timestamp.
#[must_use]
pub fn rate_limit_headers(snapshot: &RateLimitSnapshot) -> HeaderMap {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(snapshot.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(snapshot.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(now.saturating_add(snapshot.reset_after)),
    );
    headers
}

/// Display of `err` followed by each source, outermost first.
fn error_chain(err: &GateError) -> Vec<Value> {
    let mut chain = vec![Value::from(err.to_string())];
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(Value::from(cause.to_string()));
        source = cause.source();
    }
    chain
}

fn message(err: &GateError, locale: Locale) -> String {
    use Locale::{Ar, En};

    if let GateError::RateLimited(exceeded) = err {
        let secs = exceeded.retry_after();
        return match locale {
            En => format!("Too many requests. Please try again in {secs} seconds."),
            Ar => format!("عدد كبير جدًا من الطلبات. يرجى المحاولة مرة أخرى بعد {secs} ثانية."),
        };
    }

    let text = match (err, locale) {
        (GateError::Unauthenticated, En) => "Authentication required.",
        (GateError::Unauthenticated, Ar) => "يجب تسجيل الدخول أولاً.",
        (GateError::NoOrganization { .. }, En) => {
            "No organization selected. Please select or create an organization."
        }
        (GateError::NoOrganization { .. }, Ar) => "لم يتم اختيار مؤسسة. يرجى اختيار مؤسسة أو إنشاء واحدة.",
        (GateError::OrgAccessDenied { .. }, En) => "You do not have access to this organization.",
        (GateError::OrgAccessDenied { .. }, Ar) => "ليس لديك صلاحية الوصول إلى هذه المؤسسة.",
        (GateError::InsufficientRole { .. }, En) => "You do not have the required role for this action.",
        (GateError::InsufficientRole { .. }, Ar) => "ليس لديك الدور المطلوب لتنفيذ هذا الإجراء.",
        (GateError::Forbidden { .. }, En) => "You do not have permission to perform this action.",
        (GateError::Forbidden { .. }, Ar) => "ليس لديك صلاحية لتنفيذ هذا الإجراء.",
        (GateError::RateLimiterUnavailable(_) | GateError::ScopeUnavailable(_), En) => {
            "Service temporarily unavailable. Please try again later."
        }
        (GateError::RateLimiterUnavailable(_) | GateError::ScopeUnavailable(_), Ar) => {
            "الخدمة غير متاحة مؤقتًا. يرجى المحاولة لاحقًا."
        }
        (GateError::HandlerTimeout { .. }, En) => "The request took too long to complete.",
        (GateError::HandlerTimeout { .. }, Ar) => "استغرق الطلب وقتًا أطول من المسموح.",
        (_, En) => "An internal error occurred.",
        (_, Ar) => "حدث خطأ داخلي.",
    };
    text.to_string()
}
