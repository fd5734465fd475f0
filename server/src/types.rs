//! Wire protocol types.
//!
//! Every frame in both directions is `{"type": <snake_case>, "data": <payload>}`.
//! Payload field names are camelCase, matching the browser client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub type UserId = i32;
pub type VideoId = i32;
pub type SessionId = i32;

/// Frame assumed when a join does not say where the user is.
pub const DEFAULT_FRAME: i32 = 1;

// ═══════════════════════════════════════════════════════════════
// Client → Server messages
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope from client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Join(JoinMsg),
    FrameChange(FrameChangeMsg),
    AnnotationCreated(JsonValue),
    AnnotationUpdated(JsonValue),
    AnnotationDeleted(JsonValue),
}

impl ClientMessage {
    /// Wire name of the message type, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::FrameChange(_) => "frame_change",
            ClientMessage::AnnotationCreated(_) => "annotation_created",
            ClientMessage::AnnotationUpdated(_) => "annotation_updated",
            ClientMessage::AnnotationDeleted(_) => "annotation_deleted",
        }
    }
}

/// Claim presence on a video.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMsg {
    pub user_id: UserId,
    #[serde(alias = "videoFileId")]
    pub video_id: VideoId,
    #[serde(default)]
    pub current_frame: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameChangeMsg {
    pub frame_number: i32,
}

// ═══════════════════════════════════════════════════════════════
// Server → Client messages
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full active-presence list for one video, most recent activity first.
    CollaboratorsUpdated(Vec<Collaborator>),
    CollaboratorFrameChange(FrameChangeNotice),
    AnnotationCreated(JsonValue),
    AnnotationUpdated(JsonValue),
    AnnotationDeleted(JsonValue),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::CollaboratorsUpdated(_) => "collaborators_updated",
            ServerMessage::CollaboratorFrameChange(_) => "collaborator_frame_change",
            ServerMessage::AnnotationCreated(_) => "annotation_created",
            ServerMessage::AnnotationUpdated(_) => "annotation_updated",
            ServerMessage::AnnotationDeleted(_) => "annotation_deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameChangeNotice {
    pub user_id: UserId,
    pub frame_number: i32,
}

// ═══════════════════════════════════════════════════════════════
// Annotation relay
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Created,
    Updated,
    Deleted,
}

/// An already-persisted annotation change, relayed without interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationEvent {
    pub kind: AnnotationKind,
    pub payload: JsonValue,
}

impl AnnotationEvent {
    pub fn into_message(self) -> ServerMessage {
        match self.kind {
            AnnotationKind::Created => ServerMessage::AnnotationCreated(self.payload),
            AnnotationKind::Updated => ServerMessage::AnnotationUpdated(self.payload),
            AnnotationKind::Deleted => ServerMessage::AnnotationDeleted(self.payload),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Presence records
// ═══════════════════════════════════════════════════════════════

/// A user's durable presence record on one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationSession {
    pub id: SessionId,
    pub video_id: VideoId,
    pub user_id: UserId,
    pub current_frame: i32,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
}

/// Input to the gateway upsert, keyed by `(video_id, user_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewSession {
    pub video_id: VideoId,
    pub user_id: UserId,
    pub current_frame: i32,
}

/// Display info for a collaborator, when the gateway knows the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,
    pub role: String,
}

/// One entry of `collaborators_updated`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    #[serde(flatten)]
    pub session: CollaborationSession,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_accepts_legacy_video_file_id_and_optional_frame() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join","data":{"userId":3,"videoFileId":10}}"#).unwrap();
        match msg {
            ClientMessage::Join(join) => {
                assert_eq!(join.user_id, 3);
                assert_eq!(join.video_id, 10);
                assert_eq!(join.current_frame, None);
            }
            other => panic!("expected join, got {other:?}"),
        }

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"join","data":{"userId":3,"videoId":11,"currentFrame":40}}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Join(JoinMsg { video_id: 11, current_frame: Some(40), .. })
        ));
    }

    #[test]
    fn unknown_type_and_missing_fields_are_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"cursor","data":{}}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"frame_change","data":{}}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"join","data":{"userId":1}}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn annotation_payload_is_kept_verbatim() {
        let raw = json!({
            "type": "annotation_created",
            "data": {"id": 7, "videoFileId": 10, "coordinates": [[1, 2], [3, 4]], "label": "x²"}
        });
        let msg: ClientMessage = serde_json::from_value(raw.clone()).unwrap();
        let ClientMessage::AnnotationCreated(payload) = msg else {
            panic!("expected annotation_created");
        };
        let out = AnnotationEvent { kind: AnnotationKind::Created, payload }.into_message();
        assert_eq!(serde_json::to_value(out).unwrap(), raw);
    }

    #[test]
    fn outbound_shapes() {
        let notice = ServerMessage::CollaboratorFrameChange(FrameChangeNotice {
            user_id: 1,
            frame_number: 42,
        });
        assert_eq!(
            serde_json::to_value(&notice).unwrap(),
            json!({"type": "collaborator_frame_change", "data": {"userId": 1, "frameNumber": 42}})
        );

        let collaborator = Collaborator {
            session: CollaborationSession {
                id: 5,
                video_id: 10,
                user_id: 1,
                current_frame: 1,
                is_active: true,
                last_activity: Utc::now(),
            },
            user: Some(UserSummary { username: "ada".into(), role: "annotator".into() }),
        };
        let value = serde_json::to_value(ServerMessage::CollaboratorsUpdated(vec![collaborator])).unwrap();
        assert_eq!(value["type"], "collaborators_updated");
        let entry = &value["data"][0];
        for key in ["id", "videoId", "userId", "currentFrame", "isActive", "lastActivity"] {
            assert!(entry.get(key).is_some(), "collaborator entry must include `{key}`");
        }
        assert_eq!(entry["user"]["username"], "ada");
    }
}
