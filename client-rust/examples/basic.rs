//! Basic annocollab client example.
//!
//! Run with ANNOCOLLAB_URL set:
//! ```bash
//! ANNOCOLLAB_URL=ws://localhost:5000/ws cargo run --example basic
//! ```
//! Or without — the client will be no-op and silently succeed.

use std::time::Duration;

use annocollab_client::{CollabClient, ServerEvent};
use serde_json::json;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let c = CollabClient::init().await;

    if c.is_active() {
        println!("annocollab active — connected: {}", c.is_connected());
    } else {
        println!("annocollab inactive (no ANNOCOLLAB_URL) — no-op mode");
    }

    // Annotator 7 opens video 42 at the first frame.
    c.join_video(7, 42, 1).await.unwrap();

    // Scrub forward.
    tokio::time::sleep(Duration::from_millis(300)).await;
    c.update_frame(240).await.unwrap();

    // Share a box the REST layer just stored.
    c.annotation_created(json!({
        "id": 101,
        "videoFileId": 42,
        "frameNumber": 240,
        "toolType": "bounding-box",
        "annotationType": "handwritten-text",
        "coordinates": {"x": 120, "y": 80, "width": 340, "height": 60},
    }))
    .await
    .unwrap();

    // Watch what collaborators do for a few seconds.
    let deadline = tokio::time::sleep(Duration::from_secs(3));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = c.next_event() => match event {
                Some(ServerEvent::CollaboratorsUpdated(list)) => {
                    println!("{} annotator(s) on this video", list.len());
                }
                Some(ServerEvent::CollaboratorFrameChange(change)) => {
                    println!("user {} moved to frame {}", change.user_id, change.frame_number);
                }
                Some(other) => println!("annotation event: {other:?}"),
                None => break,
            },
        }
    }

    for collaborator in c.presence().collaborators() {
        println!("user {} @ frame {}", collaborator.user_id, collaborator.current_frame);
    }

    // Graceful shutdown.
    c.shutdown().await.unwrap();
}
