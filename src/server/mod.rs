//! HTTP/WebSocket surface.

pub mod routes;
pub mod ws;

pub use routes::{AppState, router};
pub use ws::{ConnectionManager, run_ui_forwarder};
