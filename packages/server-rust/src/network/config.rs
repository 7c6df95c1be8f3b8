//! Listener and transport settings.

use std::time::Duration;

/// Where the server listens and the transport limits applied to every
/// request.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// `0` lets the OS pick a port; [`NetworkModule::start`] reports it.
    ///
    /// [`NetworkModule::start`]: super::NetworkModule::start
    pub port: u16,
    /// Origins allowed by CORS. `"*"` allows any.
    pub cors_origins: Vec<String>,
    /// Upper bound for a whole request, gate and handler included.
    pub request_timeout: Duration,
    /// Use the first `X-Forwarded-For` entry as the client address. Only
    /// enable behind a proxy that sets the header itself; otherwise callers
    /// can pick the address their IP rate limit is counted against.
    pub trust_forwarded_for: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(60),
            trust_forwarded_for: false,
        }
    }
}
