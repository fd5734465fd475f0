//! Presence tracker — who is active on a video, and at what frame.
//!
//! The list comes from the gateway's durable sessions, not from this
//! process's open sockets, so every process serving the same video agrees.

use tracing::debug;

use crate::broadcast;
use crate::error::CollabError;
use crate::state::AppState;
use crate::types::{Collaborator, ServerMessage, VideoId};

/// Active sessions for `video_id`, most recent activity first.
pub async fn compute_active_presence(
    state: &AppState,
    video_id: VideoId,
) -> Result<Vec<Collaborator>, CollabError> {
    state.gateway.get_active_collaborators(video_id).await
}

/// Recompute the full list and push it as `collaborators_updated` to every
/// connection joined to the video, sender included.
pub async fn refresh(state: &AppState, video_id: VideoId) -> Result<usize, CollabError> {
    let collaborators = compute_active_presence(state, video_id).await?;
    debug!(video_id, active = collaborators.len(), "presence recomputed");
    broadcast::to_video(
        &state.registry,
        video_id,
        None,
        &ServerMessage::CollaboratorsUpdated(collaborators),
    )
}
