//! Cowrite sync server: room coordination and opaque CRDT delta relay.
//!
//! Rooms are ephemeral and memory-resident. The server admits members,
//! keeps a bounded chat history, fans document/awareness deltas out to
//! room peers without interpreting them, and evicts rooms that sit idle
//! with nobody online.

pub mod config;
pub mod handlers;
pub mod rate_limit;
pub mod rooms;

use axum::{Router, routing::any, routing::get};

use handlers::AppState;

/// Build the application router (without the CORS/trace layers, which the
/// binary adds; tests drive this router directly).
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Cowrite Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        .route("/ws", any(handlers::ws_handler))
        .merge(handlers::api_routes())
        .with_state(state)
}
