//! Session protocol state machine — one per connection.
//!
//! ```text
//! Unjoined ──join──▶ Joined ──join──▶ Joined (identity replaced)
//!     │                 │
//!     └─────close───────┴──────────▶ Closed
//! ```
//!
//! Until a connection joins, only `join` is honored; anything else is
//! dropped. Errors never close the connection: each message is handled to
//! completion, and a failure abandons only that message's side effects.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast;
use crate::error::CollabError;
use crate::presence;
use crate::registry::{ConnId, Identity, OutboundTx};
use crate::state::AppState;
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unjoined,
    Joined(Identity),
    Closed,
}

#[derive(Debug)]
pub struct Session {
    conn: ConnId,
    phase: Phase,
}

impl Session {
    /// Register a new connection whose frames are written to `outbound`.
    pub fn open(state: &AppState, outbound: OutboundTx) -> Self {
        let conn = Uuid::new_v4();
        state.registry.register(conn, outbound);
        Self { conn, phase: Phase::Unjoined }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Parse and dispatch one text frame. Failures are logged and dropped.
    pub async fn handle_text(&mut self, state: &AppState, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn = %self.conn, "malformed message dropped: {e}");
                return;
            }
        };
        let kind = msg.kind();
        match self.dispatch(state, msg).await {
            Ok(()) => {}
            Err(e @ (CollabError::NotJoined(_) | CollabError::Closed)) => {
                debug!(conn = %self.conn, kind, "ignored: {e}");
            }
            Err(e) if e.is_gateway() => {
                error!(conn = %self.conn, kind, "gateway error, message abandoned: {e}");
            }
            Err(e) => {
                warn!(conn = %self.conn, kind, "message dropped: {e}");
            }
        }
    }

    /// Apply one parsed message.
    pub async fn dispatch(&mut self, state: &AppState, msg: ClientMessage) -> Result<(), CollabError> {
        if self.phase == Phase::Closed {
            return Err(CollabError::Closed);
        }
        let kind = msg.kind();
        match msg {
            ClientMessage::Join(join) => self.on_join(state, join).await,
            ClientMessage::FrameChange(change) => {
                let identity = self.require_joined(kind)?;
                self.on_frame_change(state, identity, change).await
            }
            ClientMessage::AnnotationCreated(payload) => {
                self.relay(state, kind, AnnotationEvent { kind: AnnotationKind::Created, payload })
            }
            ClientMessage::AnnotationUpdated(payload) => {
                self.relay(state, kind, AnnotationEvent { kind: AnnotationKind::Updated, payload })
            }
            ClientMessage::AnnotationDeleted(payload) => {
                self.relay(state, kind, AnnotationEvent { kind: AnnotationKind::Deleted, payload })
            }
        }
    }

    /// Transport closed. Releases this connection's presence, if it had any.
    /// Safe to call more than once.
    pub async fn close(&mut self, state: &AppState) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;

        let Some(identity) = state.registry.remove(self.conn) else {
            debug!(conn = %self.conn, "closed before join");
            return;
        };
        info!(
            conn = %self.conn,
            user_id = identity.user_id,
            video_id = identity.video_id,
            "left video"
        );
        if let Err(e) = release_presence(state, identity).await {
            error!(
                conn = %self.conn,
                user_id = identity.user_id,
                video_id = identity.video_id,
                "presence cleanup failed: {e}"
            );
        }
    }

    fn require_joined(&self, kind: &'static str) -> Result<Identity, CollabError> {
        match self.phase {
            Phase::Joined(identity) => Ok(identity),
            Phase::Unjoined => Err(CollabError::NotJoined(kind)),
            Phase::Closed => Err(CollabError::Closed),
        }
    }

    async fn on_join(&mut self, state: &AppState, join: JoinMsg) -> Result<(), CollabError> {
        // Absent or non-positive frames start the viewer at the first frame.
        let frame = match join.current_frame {
            Some(frame) if frame >= 1 => frame,
            _ => DEFAULT_FRAME,
        };
        let identity = Identity { user_id: join.user_id, video_id: join.video_id };
        let previous = match self.phase {
            Phase::Joined(previous) if previous.video_id != identity.video_id => Some(previous),
            _ => None,
        };

        state.registry.set_identity(self.conn, identity);
        self.phase = Phase::Joined(identity);

        if let Some(previous) = previous {
            info!(
                conn = %self.conn,
                from = previous.video_id,
                to = identity.video_id,
                "connection switched video"
            );
            if let Err(e) = release_presence(state, previous).await {
                error!(
                    conn = %self.conn,
                    user_id = previous.user_id,
                    video_id = previous.video_id,
                    "presence cleanup for previous video failed: {e}"
                );
            }
        }

        let session = state
            .gateway
            .create_or_update_session(NewSession {
                video_id: identity.video_id,
                user_id: identity.user_id,
                current_frame: frame,
            })
            .await?;

        info!(
            conn = %self.conn,
            user_id = identity.user_id,
            video_id = identity.video_id,
            session_id = session.id,
            frame,
            "joined video"
        );

        presence::refresh(state, identity.video_id).await?;
        Ok(())
    }

    async fn on_frame_change(
        &self,
        state: &AppState,
        identity: Identity,
        change: FrameChangeMsg,
    ) -> Result<(), CollabError> {
        let frame = valid_frame(change.frame_number)?;

        state
            .gateway
            .create_or_update_session(NewSession {
                video_id: identity.video_id,
                user_id: identity.user_id,
                current_frame: frame,
            })
            .await?;

        let notice = ServerMessage::CollaboratorFrameChange(FrameChangeNotice {
            user_id: identity.user_id,
            frame_number: frame,
        });
        broadcast::frame_change(
            &state.registry,
            state.config.frame_change_scope,
            self.conn,
            identity.video_id,
            &notice,
        )?;
        Ok(())
    }

    /// Annotation edits are already persisted upstream; pass them on as-is.
    fn relay(&self, state: &AppState, kind: &'static str, event: AnnotationEvent) -> Result<(), CollabError> {
        let identity = self.require_joined(kind)?;
        broadcast::to_video(&state.registry, identity.video_id, Some(self.conn), &event.into_message())?;
        Ok(())
    }
}

/// Deactivate the departed user's session and refresh everyone still on the video.
async fn release_presence(state: &AppState, identity: Identity) -> Result<(), CollabError> {
    let active = state.gateway.get_active_collaborators(identity.video_id).await?;
    if let Some(mine) = active.iter().find(|c| c.session.user_id == identity.user_id) {
        state.gateway.deactivate_session(mine.session.id).await?;
    }
    presence::refresh(state, identity.video_id).await?;
    Ok(())
}

fn valid_frame(frame: i32) -> Result<i32, CollabError> {
    if frame < 1 {
        return Err(CollabError::Protocol(format!("frame number must be >= 1, got {frame}")));
    }
    Ok(frame)
}
