//! HTTP surface: configuration, authentication, the gate middleware and the
//! server lifecycle.

pub mod auth;
pub mod config;
pub mod gate;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod request;

pub use auth::{authenticate, AuthenticatedUser, Claims, JwtAuthenticator, SessionState};
pub use config::*;
pub use gate::{gate_middleware, GateState};
pub use handlers::AppState;
pub use module::NetworkModule;
pub use request::HttpGateRequest;
