//! Upload Session Store
//!
//! Persists upload-session metadata and status behind the [`SessionStore`]
//! trait. [`MemorySessionStore`] keeps sessions in a lock-protected map;
//! the SQLite implementation lives in `crate::db`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{SessionStatus, UploadError, UploadSession};

// ============================================================================
// Session Store Trait
// ============================================================================

/// Trait for session persistence backends
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a freshly created session
    async fn insert(&self, session: &UploadSession) -> Result<(), UploadError>;

    /// Get a session by ID
    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError>;

    /// Store the recounted number of uploaded chunks
    async fn set_uploaded_chunks(
        &self,
        id: Uuid,
        uploaded_chunks: u32,
        at: DateTime<Utc>,
    ) -> Result<(), UploadError>;

    /// Mark a session completed with its artifact path
    async fn mark_completed(
        &self,
        id: Uuid,
        final_path: &str,
        at: DateTime<Utc>,
    ) -> Result<(), UploadError>;

    /// Mark a session cancelled
    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), UploadError>;

    /// IDs of sessions whose expiry is at or before `now`
    async fn expired(
        &self,
        now: DateTime<Utc>,
        include_completed: bool,
    ) -> Result<Vec<Uuid>, UploadError>;

    /// Delete sessions, returning how many existed
    async fn delete_many(&self, ids: &[Uuid]) -> Result<usize, UploadError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Session store backed by a map, for tests and single-node deployments
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get session count
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn update<F>(&self, id: Uuid, f: F) -> Result<(), UploadError>
    where
        F: FnOnce(&mut UploadSession) + Send,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;
        f(session);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &UploadSession) -> Result<(), UploadError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(UploadError::Database(format!(
                "duplicate session id: {}",
                session.id
            )));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn set_uploaded_chunks(
        &self,
        id: Uuid,
        uploaded_chunks: u32,
        at: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        self.update(id, |s| {
            s.uploaded_chunks = uploaded_chunks.min(s.total_chunks);
            s.updated_at = at;
        })
        .await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        final_path: &str,
        at: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        let final_path = final_path.to_string();
        self.update(id, move |s| {
            s.status = SessionStatus::Completed;
            s.uploaded_chunks = s.total_chunks;
            s.final_path = Some(final_path);
            s.updated_at = at;
        })
        .await
    }

    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), UploadError> {
        self.update(id, |s| {
            s.status = SessionStatus::Cancelled;
            s.final_path = None;
            s.updated_at = at;
        })
        .await
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        include_completed: bool,
    ) -> Result<Vec<Uuid>, UploadError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .filter(|s| include_completed || s.status != SessionStatus::Completed)
            .map(|s| s.id)
            .collect())
    }

    async fn delete_many(&self, ids: &[Uuid]) -> Result<usize, UploadError> {
        let mut sessions = self.sessions.write().await;
        Ok(ids.iter().filter(|id| sessions.remove(*id).is_some()).count())
    }
}

// ============================================================================
// Tests
// ============================================================================
