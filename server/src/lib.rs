//! annocollabd — real-time collaboration core for video annotation.
//!
//! Tracks who is on which video at which frame, and relays annotation edits
//! between annotators over one WebSocket per client.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod presence;
pub mod registry;
pub mod session;
pub mod state;
pub mod types;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// All routes, with shared state attached.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket endpoint.
        .route("/ws", get(ws::ws_handler))
        .route("/api/collaborators/{video_id}", get(api::get_collaborators))
        // Health check (useful for K8s liveness probes).
        .route("/healthz", get(api::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
