//! Bearer-token authentication.
//!
//! Verifies an HS256 JWT from the `Authorization` header and records the
//! caller as an [`AuthenticatedUser`] request extension. A missing or
//! invalid token is not rejected here: the request simply stays anonymous
//! and the gate decides how to answer it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tenantgate_core::UserId;
use tracing::debug;

/// JWT claims understood by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    /// Organization the user last switched to, if the issuer tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_org_id: Option<String>,
}

/// Identity of a verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

/// Request-scoped session values (e.g. the "current org").
#[derive(Debug, Clone, Default)]
pub struct SessionState(pub HashMap<String, String>);

impl SessionState {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Why a bearer token was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("authorization header is not a bearer token")]
    InvalidFormat,
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

/// Verifies HS256 tokens signed with a shared secret.
#[derive(Clone)]
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
    session_org_key: String,
}

impl JwtAuthenticator {
    /// `session_org_key` is the session key the `current_org_id` claim is
    /// exposed under.
    #[must_use]
    pub fn new(secret: &[u8], session_org_key: impl Into<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["sub", "exp"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            session_org_key: session_org_key.into(),
        }
    }

    /// Verifies `token` and returns its claims.
    ///
    /// # Errors
    ///
    /// `Expired` for an expired token, `Invalid` for any other failure.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e),
            })
    }

    fn authenticate_header(&self, header: Option<&str>) -> Result<Claims, AuthError> {
        let header = header.ok_or(AuthError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidFormat)?;
        self.verify(token.trim())
    }
}

/// Axum middleware attaching [`AuthenticatedUser`] and [`SessionState`] to
/// requests carrying a valid bearer token.
pub async fn authenticate(
    State(auth): State<Arc<JwtAuthenticator>>,
    mut req: Request,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth.authenticate_header(header) {
        Ok(claims) => {
            let mut session = SessionState::default();
            if let Some(org) = claims.current_org_id {
                session.0.insert(auth.session_org_key.clone(), org);
            }
            req.extensions_mut()
                .insert(AuthenticatedUser(UserId::from(claims.sub)));
            req.extensions_mut().insert(session);
        }
        Err(AuthError::MissingToken) => {}
        Err(e) => debug!(error = %e, "bearer token rejected; continuing anonymously"),
    }
    next.run(req).await
}
