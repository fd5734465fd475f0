//! Broadcast router — serialize once, fan out to a scope of connections.
//!
//! Fire-and-forget: no acks, no retries. A recipient whose queue is gone or
//! full is skipped; its own close path cleans it up.

use std::sync::Arc;

use tracing::debug;

use crate::config::FrameChangeScope;
use crate::error::CollabError;
use crate::registry::{ConnId, ConnectionRegistry, Outbound};
use crate::types::{ServerMessage, VideoId};

pub fn encode(msg: &ServerMessage) -> Result<Outbound, CollabError> {
    Ok(Arc::from(serde_json::to_string(msg)?))
}

/// Deliver to every connection joined to `video_id`, except `exclude`.
pub fn to_video(
    registry: &ConnectionRegistry,
    video_id: VideoId,
    exclude: Option<ConnId>,
    msg: &ServerMessage,
) -> Result<usize, CollabError> {
    let frame = encode(msg)?;
    let targets: Vec<ConnId> = registry
        .connections_for_video(video_id)
        .filter(|conn| Some(*conn) != exclude)
        .collect();
    let delivered = registry.deliver(&frame, &targets);
    debug!(video_id, kind = msg.kind(), recipients = delivered, "broadcast to video");
    Ok(delivered)
}

/// Deliver to every registered connection except the sender, joined or not.
pub fn to_others_globally(
    registry: &ConnectionRegistry,
    exclude: ConnId,
    msg: &ServerMessage,
) -> Result<usize, CollabError> {
    let frame = encode(msg)?;
    let delivered = registry.fan_out(&frame, |conn| conn != exclude);
    debug!(kind = msg.kind(), recipients = delivered, "broadcast to all others");
    Ok(delivered)
}

/// Route a frame change according to the configured scope.
pub fn frame_change(
    registry: &ConnectionRegistry,
    scope: FrameChangeScope,
    sender: ConnId,
    video_id: VideoId,
    msg: &ServerMessage,
) -> Result<usize, CollabError> {
    match scope {
        FrameChangeScope::Video => to_video(registry, video_id, Some(sender), msg),
        FrameChangeScope::Global => to_others_globally(registry, sender, msg),
    }
}
