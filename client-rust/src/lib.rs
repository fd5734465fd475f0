//! annocollab Rust client.
//!
//! ```ignore
//! let c = CollabClient::init().await;
//! c.join_video(7, 42, 1).await?;
//! c.update_frame(120).await?;
//! while let Some(event) = c.next_event().await { /* ... */ }
//! ```
//!
//! If `ANNOCOLLAB_URL` is absent, `init()` returns a no-op client where all
//! methods silently succeed.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════

/// Display info the server attaches to a collaborator when it knows the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub role: String,
}

/// One entry of the presence list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: i32,
    pub video_id: i32,
    pub user_id: i32,
    pub current_frame: i32,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameChange {
    pub user_id: i32,
    pub frame_number: i32,
}

/// Everything the server pushes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    CollaboratorsUpdated(Vec<Collaborator>),
    CollaboratorFrameChange(FrameChange),
    AnnotationCreated(JsonValue),
    AnnotationUpdated(JsonValue),
    AnnotationDeleted(JsonValue),
}

/// Local picture of who is on the joined video.
///
/// Replaced wholesale by `collaborators_updated`; patched in place by
/// `collaborator_frame_change` so frame moves show up without a round trip.
#[derive(Debug, Clone, Default)]
pub struct PresenceView {
    collaborators: Vec<Collaborator>,
}

impl PresenceView {
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::CollaboratorsUpdated(list) => self.collaborators = list.clone(),
            ServerEvent::CollaboratorFrameChange(change) => {
                for c in self.collaborators.iter_mut().filter(|c| c.user_id == change.user_id) {
                    c.current_frame = change.frame_number;
                    c.last_activity = Utc::now();
                }
            }
            _ => {}
        }
    }

    pub fn collaborators(&self) -> &[Collaborator] {
        &self.collaborators
    }

    pub fn frame_of(&self, user_id: i32) -> Option<i32> {
        self.collaborators
            .iter()
            .find(|c| c.user_id == user_id)
            .map(|c| c.current_frame)
    }
}

#[derive(Debug)]
pub enum ClientError {
    /// Frame numbers start at 1.
    InvalidFrame(i32),
    /// Channel closed (background task died).
    ChannelClosed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFrame(n) => write!(f, "invalid frame number {n}"),
            Self::ChannelClosed => write!(f, "background task stopped"),
        }
    }
}

impl std::error::Error for ClientError {}

// ═══════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════

/// Collaboration client. Join a video, publish your frame, relay edits.
///
/// Internally spawns a background tokio task that owns the WebSocket,
/// reconnecting with exponential backoff + jitter. After a reconnect the last
/// join is replayed (with the latest frame, even one set while offline),
/// since the server forgets a connection's identity when it drops. Frame and
/// annotation messages sent while disconnected are not delivered.
pub struct CollabClient {
    inner: Option<ClientInner>,
}

struct ClientInner {
    tx: mpsc::Sender<Outbound>,
    connected: Arc<AtomicBool>,
    rejoin: Arc<Mutex<Rejoin>>,
    presence: Arc<Mutex<PresenceView>>,
    events: tokio::sync::Mutex<mpsc::Receiver<ServerEvent>>,
}

/// Message sent from API methods to the background task.
enum Outbound {
    Wire(WireMessage),
    Shutdown,
}

impl CollabClient {
    /// Read `ANNOCOLLAB_URL` from the environment and connect.
    /// Returns a no-op client if it is absent.
    pub async fn init() -> Self {
        match env::var("ANNOCOLLAB_URL") {
            Ok(url) if !url.trim().is_empty() => Self::connect(&url).await,
            _ => {
                debug!("ANNOCOLLAB_URL not set, using no-op client");
                Self { inner: None }
            }
        }
    }

    /// Connect to an explicit server endpoint (`ws://`, `wss://`, `http://` or `https://`).
    pub async fn connect(server_ep: &str) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let rejoin = Arc::new(Mutex::new(Rejoin::default()));
        let presence = Arc::new(Mutex::new(PresenceView::default()));
        let (tx, rx) = mpsc::channel::<Outbound>(256);
        let (events_tx, events_rx) = mpsc::channel::<ServerEvent>(256);

        let url = normalize_ws_url(server_ep);
        let bg_connected = Arc::clone(&connected);
        let bg_rejoin = Arc::clone(&rejoin);
        let bg_presence = Arc::clone(&presence);
        tokio::spawn(async move {
            ws_task(url, rx, bg_connected, bg_rejoin, bg_presence, events_tx).await;
        });

        Self {
            inner: Some(ClientInner {
                tx,
                connected,
                rejoin,
                presence,
                events: tokio::sync::Mutex::new(events_rx),
            }),
        }
    }

    /// Whether this is a real client (not no-op).
    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    /// Whether the WebSocket is currently connected.
    pub fn is_connected(&self) -> bool {
        self.inner
            .as_ref()
            .map(|i| i.connected.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Claim presence on a video. Remembered and replayed after reconnects.
    pub async fn join_video(&self, user_id: i32, video_id: i32, frame: i32) -> Result<(), ClientError> {
        check_frame(frame)?;
        let Some(inner) = &self.inner else { return Ok(()) };
        let join = WireMessage::Join(WireJoin { user_id, video_id, current_frame: frame });
        lock(&inner.rejoin).observe(&join);
        inner
            .tx
            .send(Outbound::Wire(join))
            .await
            .map_err(|_| ClientError::ChannelClosed)
    }

    /// Tell collaborators which frame you are on.
    pub async fn update_frame(&self, frame: i32) -> Result<(), ClientError> {
        check_frame(frame)?;
        let change = WireMessage::FrameChange(WireFrameChange { frame_number: frame });
        if let Some(inner) = &self.inner {
            lock(&inner.rejoin).observe(&change);
        }
        self.send_live(change)
    }

    /// Relay an annotation the REST layer has just created.
    pub async fn annotation_created(&self, annotation: JsonValue) -> Result<(), ClientError> {
        self.send_live(WireMessage::AnnotationCreated(annotation))
    }

    pub async fn annotation_updated(&self, annotation: JsonValue) -> Result<(), ClientError> {
        self.send_live(WireMessage::AnnotationUpdated(annotation))
    }

    /// `reference` is normally `{"id": .., "videoId": ..}`.
    pub async fn annotation_deleted(&self, reference: JsonValue) -> Result<(), ClientError> {
        self.send_live(WireMessage::AnnotationDeleted(reference))
    }

    /// Next event pushed by the server. `None` once the client is shut down
    /// (always `None` for a no-op client).
    pub async fn next_event(&self) -> Option<ServerEvent> {
        let inner = self.inner.as_ref()?;
        inner.events.lock().await.recv().await
    }

    /// Snapshot of the current presence list.
    pub fn presence(&self) -> PresenceView {
        self.inner
            .as_ref()
            .map(|i| lock(&i.presence).clone())
            .unwrap_or_default()
    }

    /// Graceful shutdown. Closes the connection so the server releases our presence.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        if let Some(inner) = &self.inner {
            let _ = inner.tx.send(Outbound::Shutdown).await;
            // Give the background task a moment to send the close frame.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    // ── Internal ────────────────────────────────────────────

    fn send_live(&self, msg: WireMessage) -> Result<(), ClientError> {
        let inner = match &self.inner {
            Some(i) => i,
            None => return Ok(()), // no-op client
        };
        if !inner.connected.load(Ordering::Relaxed) {
            debug!("not connected, message dropped");
            return Ok(());
        }
        match inner.tx.try_send(Outbound::Wire(msg)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("outbound queue full, message dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClientError::ChannelClosed),
        }
    }
}

fn check_frame(frame: i32) -> Result<(), ClientError> {
    if frame < 1 {
        return Err(ClientError::InvalidFrame(frame));
    }
    Ok(())
}

fn lock<T>(shared: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════
// Background WebSocket task
// ═══════════════════════════════════════════════════════════════

/// Wire protocol: client → server messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum WireMessage {
    Join(WireJoin),
    FrameChange(WireFrameChange),
    AnnotationCreated(JsonValue),
    AnnotationUpdated(JsonValue),
    AnnotationDeleted(JsonValue),
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireJoin {
    user_id: i32,
    video_id: i32,
    current_frame: i32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireFrameChange {
    frame_number: i32,
}

/// What to replay after a reconnect. Updated by the API methods as they are
/// called, connected or not.
#[derive(Debug, Default)]
struct Rejoin {
    last_join: Option<WireJoin>,
}

impl Rejoin {
    fn observe(&mut self, msg: &WireMessage) {
        match msg {
            WireMessage::Join(join) => self.last_join = Some(*join),
            WireMessage::FrameChange(change) => {
                if let Some(join) = self.last_join.as_mut() {
                    join.current_frame = change.frame_number;
                }
            }
            _ => {}
        }
    }

    fn replay(&self) -> Option<WireMessage> {
        self.last_join.map(WireMessage::Join)
    }
}

/// Accepts ws(s):// or http(s):// endpoints and appends `/ws` when missing.
fn normalize_ws_url(ep: &str) -> String {
    let trimmed = ep.trim_end_matches('/');
    let url = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_owned()
    };
    match url.ends_with("/ws") {
        true => url,
        false => format!("{url}/ws"),
    }
}

fn encode(msg: &WireMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!("serialize error, message dropped: {e}");
            None
        }
    }
}

/// Background task: owns the WebSocket, handles send/recv, reconnects.
async fn ws_task(
    url: String,
    mut rx: mpsc::Receiver<Outbound>,
    connected: Arc<AtomicBool>,
    rejoin: Arc<Mutex<Rejoin>>,
    presence: Arc<Mutex<PresenceView>>,
    events: mpsc::Sender<ServerEvent>,
) {
    let mut attempt: u32 = 0;

    loop {
        // ── Connect ─────────────────────────────────────────
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => {
                info!(url = %url, "WebSocket connected");
                attempt = 0;
                stream
            }
            Err(e) => {
                warn!(url = %url, attempt, "WebSocket connect failed: {e}");
                connected.store(false, Ordering::Relaxed);
                backoff_sleep(attempt).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // ── Rejoin ──────────────────────────────────────────
        let replay = lock(&rejoin).replay();
        if let Some(frame) = replay.as_ref().and_then(encode) {
            if let Err(e) = ws_tx.send(frame).await {
                warn!("failed to replay join: {e}");
                backoff_sleep(attempt).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
            debug!("join replayed after reconnect");
        }

        connected.store(true, Ordering::Relaxed);

        // ── Message loop ────────────────────────────────────
        loop {
            tokio::select! {
                // Outbound messages from API methods.
                msg = rx.recv() => {
                    match msg {
                        Some(Outbound::Wire(wire)) => {
                            let Some(frame) = encode(&wire) else { continue };
                            if let Err(e) = ws_tx.send(frame).await {
                                warn!("send error: {e}");
                                break; // reconnect
                            }
                        }
                        Some(Outbound::Shutdown) | None => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            connected.store(false, Ordering::Relaxed);
                            return;
                        }
                    }
                }
                // Inbound events from the server.
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    lock(&presence).apply(&event);
                                    if events.try_send(event).is_err() {
                                        debug!("event queue full or closed, event dropped");
                                    }
                                }
                                Err(e) => debug!("unrecognized server frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("server closed connection");
                            break; // reconnect
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(e)) => {
                            warn!("ws recv error: {e}");
                            break; // reconnect
                        }
                        None => {
                            info!("ws stream ended");
                            break; // reconnect
                        }
                    }
                }
            }
        }

        // Connection lost — loop back to reconnect.
        connected.store(false, Ordering::Relaxed);
        backoff_sleep(attempt).await;
        attempt = attempt.saturating_add(1);
    }
}

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Doubling delay from 100ms, capped at 30s, plus up to 50% jitter.
fn reconnect_delay(attempt: u32) -> Duration {
    let doubled = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt));
    let delay_ms = doubled.min(BACKOFF_CAP_MS);
    let jitter_ms = rand::thread_rng().gen_range(0..=delay_ms / 2);
    Duration::from_millis(delay_ms + jitter_ms)
}

async fn backoff_sleep(attempt: u32) {
    let delay = reconnect_delay(attempt);
    debug!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting after delay");
    tokio::time::sleep(delay).await;
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
