//! Background lifecycle tasks.
//!
//! **Stale-session sweeper** — sessions left active by a process that died
//! without running its close path would otherwise stay in every presence
//! list forever. When enabled, periodically deactivates sessions idle past
//! the threshold and refreshes presence on each affected video.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::CollabError;
use crate::presence;
use crate::state::AppState;

/// Spawn the sweeper if `STALE_SESSION_SECS` enables it.
pub fn spawn_stale_session_sweeper(state: Arc<AppState>) -> Option<tokio::task::JoinHandle<()>> {
    let max_idle = state.config.stale_session_after()?;
    let period = Duration::from_secs(state.config.sweep_interval_secs);
    info!(
        max_idle_secs = max_idle.as_secs(),
        every_secs = period.as_secs(),
        "stale session sweeper enabled"
    );

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_stale_sessions(&state, max_idle).await {
                warn!("stale session sweep error: {e}");
            }
        }
    }))
}

/// One sweep. Returns how many videos had their presence refreshed.
pub async fn sweep_stale_sessions(state: &AppState, max_idle: Duration) -> Result<usize, CollabError> {
    let videos = state.gateway.deactivate_stale_sessions(max_idle).await?;
    for &video_id in &videos {
        presence::refresh(state, video_id).await?;
    }
    if !videos.is_empty() {
        info!(count = videos.len(), "stale sessions deactivated");
    }
    Ok(videos.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway::SessionGateway;
    use crate::registry::{outbound_queue, Identity};
    use crate::types::NewSession;
    use uuid::Uuid;

    #[tokio::test]
    async fn sweep_refreshes_watchers_of_affected_videos() {
        let state = AppState::new(SessionGateway::memory(), Config::default());
        let watcher = Uuid::new_v4();
        let (tx, mut rx) = outbound_queue(4);
        state.registry.register(watcher, tx);
        state.registry.set_identity(watcher, Identity { user_id: 2, video_id: 10 });

        state
            .gateway
            .create_or_update_session(NewSession { video_id: 10, user_id: 1, current_frame: 3 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sweep_stale_sessions(&state, Duration::from_secs(60)).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(sweep_stale_sessions(&state, Duration::from_millis(1)).await.unwrap(), 1);
        let frame = rx.try_recv().unwrap();
        let update: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(update["type"], "collaborators_updated");
        assert_eq!(update["data"], serde_json::json!([]));
    }

    #[test]
    fn sweeper_not_spawned_when_disabled() {
        let state = AppState::new(SessionGateway::memory(), Config::default());
        assert!(spawn_stale_session_sweeper(state).is_none());
    }
}
