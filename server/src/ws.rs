//! WebSocket transport.
//!
//! Flow per connection:
//! 1. Accept WS upgrade
//! 2. Register with an outbound queue drained by a writer task
//! 3. Feed each text frame, in order, to the session state machine
//! 4. On close/error: run the session's close path, stop the writer

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::registry::outbound_queue;
use crate::session::Session;
use crate::state::AppState;

/// Axum handler for GET /ws — upgrades to WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut receiver) = socket.split();
    let (tx, mut rx) = outbound_queue(state.config.outbound_queue_capacity);

    let mut session = Session::open(&state, tx);
    let conn = session.conn();
    info!(conn = %conn, connections = state.registry.len(), "client connected");

    // Broadcasts land in the queue from any task; only this one writes the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(String::from(&*frame).into())).await {
                debug!(conn = %conn, "send failed, writer stopping: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_text(&state, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => { /* axum auto-pongs */ }
            Ok(Message::Binary(_)) => {
                warn!(conn = %conn, "binary frame ignored");
            }
            Err(e) => {
                warn!(conn = %conn, "ws recv error: {e}");
                break;
            }
        }
    }

    // Dropping the registry entry drops the last queue sender, ending the writer.
    session.close(&state).await;
    let _ = writer.await;
    info!(conn = %conn, connections = state.registry.len(), "client disconnected");
}
