//! Expired session reclamation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::chunk_store::ChunkStore;
use super::locks::SessionLocks;
use super::session::SessionStore;
use super::types::{SessionStatus, UploadError};

/// Sessions purged in parallel per sweep
const PURGE_CONCURRENCY: usize = 8;

/// Removes sessions past their expiry together with their chunks
#[derive(Clone)]
pub struct ExpirationSweeper {
    sessions: Arc<dyn SessionStore>,
    chunks: ChunkStore,
    locks: Arc<SessionLocks>,
    retain_completed: bool,
}

impl ExpirationSweeper {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        chunks: ChunkStore,
        locks: Arc<SessionLocks>,
        retain_completed: bool,
    ) -> Self {
        Self {
            sessions,
            chunks,
            locks,
            retain_completed,
        }
    }

    /// Sweep once, returning the number of sessions removed
    pub async fn sweep(&self) -> Result<usize, UploadError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep sessions expired as of `now`.
    ///
    /// A session whose chunks cannot be purged is kept for the next sweep.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, UploadError> {
        let candidates = self.sessions.expired(now, !self.retain_completed).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let purged: Vec<Uuid> = stream::iter(candidates)
            .map(|id| async move { self.purge_session(id, now).await })
            .buffer_unordered(PURGE_CONCURRENCY)
            .filter_map(|id| async move { id })
            .collect()
            .await;

        let removed = self.sessions.delete_many(&purged).await?;
        for id in &purged {
            self.locks.release(*id);
        }

        if removed > 0 {
            tracing::info!(removed = removed, "Cleaned up expired upload sessions");
        }
        Ok(removed)
    }

    async fn purge_session(&self, id: Uuid, now: DateTime<Utc>) -> Option<Uuid> {
        let _guard = self.locks.acquire(id).await;

        // A merge may have finished while waiting for the lock
        match self.sessions.get(id).await {
            Ok(Some(session)) => {
                if !session.is_expired_at(now)
                    || (self.retain_completed && session.status == SessionStatus::Completed)
                {
                    return None;
                }
            }
            Ok(None) => {
                self.locks.release(id);
                return None;
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to load expired session");
                return None;
            }
        }

        match self.chunks.purge(id).await {
            Ok(files) => {
                tracing::debug!(session_id = %id, files = files, "Purged expired session chunks");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to purge expired session");
                None
            }
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` on a background task
    pub fn start(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::error!(error = %e, "Expired upload sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::session::MemorySessionStore;
    use crate::upload::types::{ChunkLayout, UploadSession};
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        sessions: Arc<MemorySessionStore>,
        chunks: ChunkStore,
        locks: Arc<SessionLocks>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let chunks = ChunkStore::with_local_storage(temp_dir.path().join("chunks"));
            Self {
                _temp_dir: temp_dir,
                sessions: Arc::new(MemorySessionStore::new()),
                chunks,
                locks: Arc::new(SessionLocks::new()),
            }
        }

        fn sweeper(&self, retain_completed: bool) -> ExpirationSweeper {
            ExpirationSweeper::new(
                self.sessions.clone(),
                self.chunks.clone(),
                self.locks.clone(),
                retain_completed,
            )
        }

        async fn session_created_at(&self, created_at: DateTime<Utc>) -> Uuid {
            let session = UploadSession::new(
                "a.bin".to_string(),
                3,
                ChunkLayout { chunk_size: 3, total_chunks: 1 },
                None,
                "1".to_string(),
                ChronoDuration::hours(24),
                created_at,
            );
            self.sessions.insert(&session).await.unwrap();
            self.chunks.reserve(session.id).await.unwrap();
            let staged = self.chunks.stage(session.id, 0, b"abc").await.unwrap();
            self.chunks.commit(staged, None).await.unwrap();
            session.id
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let fixture = Fixture::new();
        let now = Utc::now();
        let stale = fixture.session_created_at(now - ChronoDuration::hours(25)).await;
        let fresh = fixture.session_created_at(now - ChronoDuration::hours(1)).await;

        let removed = fixture.sweeper(true).sweep_at(now).await.unwrap();

        assert_eq!(removed, 1);
        assert!(fixture.sessions.get(stale).await.unwrap().is_none());
        assert_eq!(fixture.chunks.count(stale).await.unwrap(), 0);
        assert!(fixture.sessions.get(fresh).await.unwrap().is_some());
        assert_eq!(fixture.chunks.count(fresh).await.unwrap(), 1);
        assert!(fixture.locks.is_empty());
    }

    #[tokio::test]
    async fn test_completed_sessions_are_retained() {
        let fixture = Fixture::new();
        let now = Utc::now();
        let done = fixture.session_created_at(now - ChronoDuration::hours(30)).await;
        fixture
            .sessions
            .mark_completed(done, "/tmp/uploads/a.bin", now - ChronoDuration::hours(29))
            .await
            .unwrap();
        let cancelled = fixture.session_created_at(now - ChronoDuration::hours(30)).await;
        fixture
            .sessions
            .mark_cancelled(cancelled, now - ChronoDuration::hours(29))
            .await
            .unwrap();

        assert_eq!(fixture.sweeper(true).sweep_at(now).await.unwrap(), 1);
        assert!(fixture.sessions.get(done).await.unwrap().is_some());
        assert!(fixture.sessions.get(cancelled).await.unwrap().is_none());

        assert_eq!(fixture.sweeper(false).sweep_at(now).await.unwrap(), 1);
        assert!(fixture.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_expired() {
        let fixture = Fixture::new();
        fixture.session_created_at(Utc::now()).await;
        assert_eq!(fixture.sweeper(true).sweep().await.unwrap(), 0);
        assert_eq!(fixture.sessions.len().await, 1);
    }
}
