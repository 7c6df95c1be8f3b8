//! The gate's view of an axum request.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, MatchedPath, RawPathParams};
use axum::http::header::ACCEPT;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tenantgate_core::{GateRequest, UserId};

use super::auth::{AuthenticatedUser, SessionState};

/// Owned snapshot of the parts of an HTTP request the gate reads.
///
/// Built before the request is handed downstream, so the body never has to
/// be shared with the gate.
#[derive(Debug, Clone, Default)]
pub struct HttpGateRequest {
    user: Option<UserId>,
    params: Vec<(String, String)>,
    headers: HeaderMap,
    session: SessionState,
    ip: Option<IpAddr>,
    route: String,
    path: String,
}

impl HttpGateRequest {
    /// Captures identity, route params, headers, session and client address.
    ///
    /// The client address is the socket peer. The first `X-Forwarded-For`
    /// entry replaces it only when `trust_forwarded_for` is set, which is
    /// safe only behind a proxy that overwrites the header.
    #[must_use]
    pub fn from_parts(
        parts: &Parts,
        params: Option<&RawPathParams>,
        trust_forwarded_for: bool,
    ) -> Self {
        let extensions = &parts.extensions;
        let forwarded_for = trust_forwarded_for
            .then(|| parts.headers.get("x-forwarded-for"))
            .flatten()
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|ip| ip.trim().parse().ok());
        let peer = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Self {
            user: extensions
                .get::<AuthenticatedUser>()
                .map(|AuthenticatedUser(id)| id.clone()),
            params: params
                .map(|p| {
                    p.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            headers: parts.headers.clone(),
            session: extensions.get::<SessionState>().cloned().unwrap_or_default(),
            ip: forwarded_for.or(peer),
            route: extensions
                .get::<MatchedPath>()
                .map_or_else(|| parts.uri.path().to_string(), |m| m.as_str().to_string()),
            path: parts.uri.path().to_string(),
        }
    }
}

impl GateRequest for HttpGateRequest {
    fn user_id(&self) -> Option<UserId> {
        self.user.clone()
    }

    fn route_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `/api/` paths, JSON `Accept` headers and XHR callers get envelopes.
    fn is_api_request(&self) -> bool {
        self.path.starts_with("/api/")
            || self
                .headers
                .get(ACCEPT)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|accept| accept.contains("application/json"))
            || self.header("x-requested-with") == Some("XMLHttpRequest")
    }

    fn session_value(&self, key: &str) -> Option<&str> {
        self.session.get(key)
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.ip
    }

    fn route(&self) -> &str {
        &self.route
    }
}
