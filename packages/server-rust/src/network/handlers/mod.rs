//! Handlers owned by the server itself, as opposed to the gated
//! application routes.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports the handler functions for building the router.

pub mod health;

pub use health::{health_handler, liveness_handler};

use std::time::Instant;

use crate::gate::RequestGate;

/// Shared application state passed to server handlers via `State` extraction.
///
/// Cloning is cheap: the gate is reference-counted internally.
#[derive(Clone)]
pub struct AppState {
    /// Gate whose scope usage is reported by the health endpoint.
    pub gate: RequestGate,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
