// =============================================================================
// Dashboard API: REST + WebSocket over axum
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

pub use rest::router;
