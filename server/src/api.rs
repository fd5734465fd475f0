//! Read-only HTTP surface next to the WebSocket endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::warn;

use crate::error::CollabError;
use crate::presence;
use crate::state::AppState;
use crate::types::{Collaborator, VideoId};

/// GET /api/collaborators/{video_id} — same list `collaborators_updated` carries.
pub async fn get_collaborators(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<VideoId>,
) -> Result<Json<Vec<Collaborator>>, CollabError> {
    let collaborators = presence::compute_active_presence(&state, video_id).await?;
    Ok(Json(collaborators))
}

/// Liveness probe. Fails when the gateway does not answer.
pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.gateway.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            warn!("health check failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "gateway unavailable")
        }
    }
}
