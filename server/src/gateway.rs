//! Persistence gateway — durable collaboration sessions.
//!
//! The core never touches storage directly; every read and write of
//! presence goes through [`SessionGateway`]. The upsert is atomic per
//! `(video_id, user_id)`: concurrent writers race, last write wins.
//!
//! Postgres queries are runtime-checked (no live DB needed at compile time).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::CollabError;
use crate::types::{
    CollaborationSession, Collaborator, NewSession, SessionId, UserId, UserSummary, VideoId,
};

/// Schema applied at startup. Every statement is idempotent.
pub const SCHEMA: &str = include_str!("../migrations/001_init.sql");

#[derive(Clone)]
pub enum SessionGateway {
    Postgres(PgPool),
    Memory(MemoryGateway),
}

impl SessionGateway {
    pub fn memory() -> Self {
        Self::Memory(MemoryGateway::default())
    }

    /// Create the tables this server reads and writes, if missing.
    pub async fn migrate(&self) -> Result<(), CollabError> {
        if let Self::Postgres(pool) = self {
            sqlx::raw_sql(SCHEMA).execute(pool).await?;
        }
        Ok(())
    }

    /// Cheap liveness check for `/healthz`.
    pub async fn ping(&self) -> Result<(), CollabError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
                Ok(())
            }
            Self::Memory(mem) => mem.check(),
        }
    }

    /// Active sessions on a video, most recent activity first.
    pub async fn get_active_collaborators(
        &self,
        video_id: VideoId,
    ) -> Result<Vec<Collaborator>, CollabError> {
        match self {
            Self::Postgres(pool) => pg::get_active_collaborators(pool, video_id).await,
            Self::Memory(mem) => mem.get_active_collaborators(video_id).await,
        }
    }

    /// Insert the session for `(video_id, user_id)` or refresh the existing
    /// one: frame replaced, reactivated, `last_activity` bumped.
    pub async fn create_or_update_session(
        &self,
        new: NewSession,
    ) -> Result<CollaborationSession, CollabError> {
        match self {
            Self::Postgres(pool) => pg::create_or_update_session(pool, new).await,
            Self::Memory(mem) => mem.create_or_update_session(new).await,
        }
    }

    /// Mark a session inactive. The row is kept as history.
    pub async fn deactivate_session(&self, session_id: SessionId) -> Result<(), CollabError> {
        match self {
            Self::Postgres(pool) => pg::deactivate_session(pool, session_id).await,
            Self::Memory(mem) => mem.deactivate_session(session_id).await,
        }
    }

    /// Deactivate every active session idle for longer than `max_idle`.
    /// Returns the distinct videos that lost a collaborator.
    pub async fn deactivate_stale_sessions(
        &self,
        max_idle: Duration,
    ) -> Result<Vec<VideoId>, CollabError> {
        match self {
            Self::Postgres(pool) => pg::deactivate_stale_sessions(pool, max_idle).await,
            Self::Memory(mem) => mem.deactivate_stale_sessions(max_idle).await,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Postgres
// ═══════════════════════════════════════════════════════════════

mod pg {
    use super::*;

    /// Row returned from collaboration_sessions queries.
    #[derive(Debug, sqlx::FromRow)]
    struct SessionRow {
        id: i32,
        video_id: i32,
        user_id: i32,
        current_frame: i32,
        is_active: bool,
        last_activity: DateTime<Utc>,
    }

    impl SessionRow {
        fn into_session(self) -> CollaborationSession {
            CollaborationSession {
                id: self.id,
                video_id: self.video_id,
                user_id: self.user_id,
                current_frame: self.current_frame,
                is_active: self.is_active,
                last_activity: self.last_activity,
            }
        }
    }

    #[derive(Debug, sqlx::FromRow)]
    struct CollaboratorRow {
        #[sqlx(flatten)]
        session: SessionRow,
        username: Option<String>,
        role: Option<String>,
    }

    impl CollaboratorRow {
        fn into_collaborator(self) -> Collaborator {
            let role = self.role;
            let user = self.username.map(|username| UserSummary {
                username,
                role: role.unwrap_or_else(|| "annotator".into()),
            });
            Collaborator { session: self.session.into_session(), user }
        }
    }

    pub(super) async fn get_active_collaborators(
        pool: &PgPool,
        video_id: VideoId,
    ) -> Result<Vec<Collaborator>, CollabError> {
        let rows: Vec<CollaboratorRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.video_file_id AS video_id, s.user_id, s.current_frame,
                   s.is_active, s.last_activity, u.username, u.role
            FROM collaboration_sessions s
            LEFT JOIN users u ON u.id = s.user_id
            WHERE s.video_file_id = $1 AND s.is_active
            ORDER BY s.last_activity DESC
            "#,
        )
        .bind(video_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(CollaboratorRow::into_collaborator).collect())
    }

    pub(super) async fn create_or_update_session(
        pool: &PgPool,
        new: NewSession,
    ) -> Result<CollaborationSession, CollabError> {
        let row: SessionRow = sqlx::query_as(
            r#"
            INSERT INTO collaboration_sessions
                (video_file_id, user_id, current_frame, is_active, last_activity)
            VALUES ($1, $2, $3, TRUE, NOW())
            ON CONFLICT (video_file_id, user_id) DO UPDATE SET
                current_frame = EXCLUDED.current_frame,
                is_active = TRUE,
                last_activity = NOW()
            RETURNING id, video_file_id AS video_id, user_id, current_frame,
                      is_active, last_activity
            "#,
        )
        .bind(new.video_id)
        .bind(new.user_id)
        .bind(new.current_frame)
        .fetch_one(pool)
        .await?;
        Ok(row.into_session())
    }

    pub(super) async fn deactivate_session(
        pool: &PgPool,
        session_id: SessionId,
    ) -> Result<(), CollabError> {
        sqlx::query("UPDATE collaboration_sessions SET is_active = FALSE WHERE id = $1")
            .bind(session_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub(super) async fn deactivate_stale_sessions(
        pool: &PgPool,
        max_idle: Duration,
    ) -> Result<Vec<VideoId>, CollabError> {
        let secs = i64::try_from(max_idle.as_secs()).unwrap_or(i64::MAX);
        let videos: Vec<i32> = sqlx::query_scalar(
            r#"
            UPDATE collaboration_sessions SET is_active = FALSE
            WHERE is_active
              AND last_activity < NOW() - ($1::BIGINT * INTERVAL '1 second')
            RETURNING video_file_id
            "#,
        )
        .bind(secs)
        .fetch_all(pool)
        .await?;
        Ok(videos.into_iter().collect::<BTreeSet<_>>().into_iter().collect())
    }
}

// ═══════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════

/// Gateway backed by a keyed map. For local runs and tests.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<RwLock<MemoryStore>>,
    offline: Arc<AtomicBool>,
}

#[derive(Default)]
struct MemoryStore {
    sessions: HashMap<(VideoId, UserId), CollaborationSession>,
    users: HashMap<UserId, UserSummary>,
    next_id: SessionId,
}

impl MemoryGateway {
    /// Register display info returned alongside a user's sessions.
    pub async fn add_user(&self, user_id: UserId, username: &str, role: &str) {
        self.inner.write().await.users.insert(
            user_id,
            UserSummary { username: username.into(), role: role.into() },
        );
    }

    /// Simulate an unreachable store: every call fails until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every stored row, active or not, ordered by id.
    pub async fn all_sessions(&self) -> Vec<CollaborationSession> {
        let mut rows: Vec<_> = self.inner.read().await.sessions.values().cloned().collect();
        rows.sort_by_key(|s| s.id);
        rows
    }

    fn check(&self) -> Result<(), CollabError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CollabError::Unavailable("memory gateway offline".into()));
        }
        Ok(())
    }

    async fn get_active_collaborators(
        &self,
        video_id: VideoId,
    ) -> Result<Vec<Collaborator>, CollabError> {
        self.check()?;
        let store = self.inner.read().await;
        let mut active: Vec<Collaborator> = store
            .sessions
            .values()
            .filter(|s| s.video_id == video_id && s.is_active)
            .map(|s| Collaborator {
                session: s.clone(),
                user: store.users.get(&s.user_id).cloned(),
            })
            .collect();
        active.sort_by(|a, b| {
            b.session
                .last_activity
                .cmp(&a.session.last_activity)
                .then(b.session.id.cmp(&a.session.id))
        });
        Ok(active)
    }

    async fn create_or_update_session(
        &self,
        new: NewSession,
    ) -> Result<CollaborationSession, CollabError> {
        self.check()?;
        let mut store = self.inner.write().await;
        let now = Utc::now();
        let next_id = store.next_id + 1;
        let session = store
            .sessions
            .entry((new.video_id, new.user_id))
            .and_modify(|s| {
                s.current_frame = new.current_frame;
                s.is_active = true;
                s.last_activity = now;
            })
            .or_insert_with(|| CollaborationSession {
                id: next_id,
                video_id: new.video_id,
                user_id: new.user_id,
                current_frame: new.current_frame,
                is_active: true,
                last_activity: now,
            })
            .clone();
        if session.id == next_id {
            store.next_id = next_id;
        }
        Ok(session)
    }

    async fn deactivate_session(&self, session_id: SessionId) -> Result<(), CollabError> {
        self.check()?;
        let mut store = self.inner.write().await;
        if let Some(session) = store.sessions.values_mut().find(|s| s.id == session_id) {
            session.is_active = false;
        }
        Ok(())
    }

    async fn deactivate_stale_sessions(
        &self,
        max_idle: Duration,
    ) -> Result<Vec<VideoId>, CollabError> {
        self.check()?;
        let cutoff = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut store = self.inner.write().await;
        let mut videos = BTreeSet::new();
        for session in store.sessions.values_mut() {
            if session.is_active && session.last_activity < cutoff {
                session.is_active = false;
                videos.insert(session.video_id);
            }
        }
        Ok(videos.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(video_id: VideoId, user_id: UserId, current_frame: i32) -> NewSession {
        NewSession { video_id, user_id, current_frame }
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_video_and_user() {
        let gw = SessionGateway::memory();
        let first = gw.create_or_update_session(join(10, 1, 5)).await.unwrap();
        let again = gw.create_or_update_session(join(10, 1, 5)).await.unwrap();
        let other_video = gw.create_or_update_session(join(11, 1, 1)).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other_video.id);

        let active = gw.get_active_collaborators(10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session.current_frame, 5);
        assert!(active[0].session.is_active);
    }

    #[tokio::test]
    async fn frame_update_round_trips_and_advances_activity() {
        let gw = SessionGateway::memory();
        let before = gw.create_or_update_session(join(10, 1, 5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        gw.create_or_update_session(join(10, 1, 9)).await.unwrap();

        let active = gw.get_active_collaborators(10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session.id, before.id);
        assert_eq!(active[0].session.current_frame, 9);
        assert!(active[0].session.last_activity > before.last_activity);
    }

    #[tokio::test]
    async fn active_list_is_most_recent_first_with_user_info() {
        let mem = MemoryGateway::default();
        mem.add_user(2, "grace", "lead_annotator").await;
        let gw = SessionGateway::Memory(mem);

        gw.create_or_update_session(join(10, 1, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        gw.create_or_update_session(join(10, 2, 1)).await.unwrap();

        let active = gw.get_active_collaborators(10).await.unwrap();
        let users: Vec<_> = active.iter().map(|c| c.session.user_id).collect();
        assert_eq!(users, vec![2, 1]);
        assert_eq!(active[0].user.as_ref().map(|u| u.username.as_str()), Some("grace"));
        assert_eq!(active[1].user, None);
    }

    #[tokio::test]
    async fn deactivate_keeps_row_and_rejoin_reactivates() {
        let mem = MemoryGateway::default();
        let gw = SessionGateway::Memory(mem.clone());
        let session = gw.create_or_update_session(join(10, 1, 3)).await.unwrap();

        gw.deactivate_session(session.id).await.unwrap();
        assert!(gw.get_active_collaborators(10).await.unwrap().is_empty());
        let rows = mem.all_sessions().await;
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_active);

        let back = gw.create_or_update_session(join(10, 1, 4)).await.unwrap();
        assert_eq!(back.id, session.id);
        assert!(back.is_active);
    }

    #[tokio::test]
    async fn stale_sweep_reports_each_video_once() {
        let gw = SessionGateway::memory();
        gw.create_or_update_session(join(10, 1, 1)).await.unwrap();
        gw.create_or_update_session(join(10, 2, 1)).await.unwrap();
        gw.create_or_update_session(join(12, 1, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(gw.deactivate_stale_sessions(Duration::from_secs(3600)).await.unwrap().is_empty());
        let swept = gw.deactivate_stale_sessions(Duration::from_millis(1)).await.unwrap();
        assert_eq!(swept, vec![10, 12]);
        assert!(gw.get_active_collaborators(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let mem = MemoryGateway::default();
        let gw = SessionGateway::Memory(mem.clone());
        mem.set_offline(true);

        let err = gw.create_or_update_session(join(1, 1, 1)).await.unwrap_err();
        assert!(err.is_gateway());
        assert!(gw.ping().await.is_err());

        mem.set_offline(false);
        assert!(gw.ping().await.is_ok());
    }
}
