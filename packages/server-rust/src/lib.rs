//! Tenantgate server: a multi-tenant request gate with per-request tenant
//! context, rate limiting and permission checks, plus its axum adapter.

pub mod gate;
pub mod network;

pub use gate::{GateConfig, GateError, Gated, RequestGate, RoutePolicy};
