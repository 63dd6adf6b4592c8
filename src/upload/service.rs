//! Upload Orchestrator
//!
//! Coordinates the chunked upload lifecycle on top of the session store,
//! the chunk store and the artifact writer:
//! - init: validate, compute the chunk layout, create the session
//! - upload_chunk: verify and record one chunk, idempotently
//! - merge: assemble, verify, complete, purge
//! - progress / chunk_exists / missing_chunks: read-only queries
//! - cancel and cleanup_expired: reclaim storage

use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::config::UploadConfig;

use super::chunk_store::ChunkStore;
use super::hashing::{compute_hash, hashes_match};
use super::locks::SessionLocks;
use super::session::{MemorySessionStore, SessionStore};
use super::sweeper::ExpirationSweeper;
use super::types::{
    ChunkAck, ChunkLayout, InitRequest, MergeOutcome, SessionDescriptor, SessionStatus,
    UploadError, UploadSession,
};
use super::writer::ArtifactWriter;

// ============================================================================
// Upload Service
// ============================================================================

/// Public entry point of the chunked upload subsystem
#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

struct UploadServiceInner {
    config: UploadConfig,
    sessions: Arc<dyn SessionStore>,
    chunks: ChunkStore,
    writer: ArtifactWriter,
    locks: Arc<SessionLocks>,
    sweeper: ExpirationSweeper,
}

impl UploadService {
    /// Create a service over explicit stores
    pub fn new(config: UploadConfig, sessions: Arc<dyn SessionStore>, chunks: ChunkStore) -> Self {
        let locks = Arc::new(SessionLocks::new());
        let writer = ArtifactWriter::new(config.artifact_dir.clone(), config.hash_algorithm);
        let sweeper = ExpirationSweeper::new(
            sessions.clone(),
            chunks.clone(),
            locks.clone(),
            config.retain_completed,
        );

        Self {
            inner: Arc::new(UploadServiceInner {
                config,
                sessions,
                chunks,
                writer,
                locks,
                sweeper,
            }),
        }
    }

    /// Create a service with in-memory metadata and chunk bytes under
    /// `config.chunk_dir`
    pub fn in_memory(config: UploadConfig) -> Self {
        let chunks = ChunkStore::with_local_storage(config.chunk_dir.clone());
        Self::new(config, Arc::new(MemorySessionStore::new()), chunks)
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    pub fn sweeper(&self) -> &ExpirationSweeper {
        &self.inner.sweeper
    }

    /// Parse a client-supplied upload id; malformed ids are unknown sessions
    pub fn parse_upload_id(upload_id: &str) -> Result<Uuid, UploadError> {
        Uuid::parse_str(upload_id.trim())
            .map_err(|_| UploadError::SessionNotFound(upload_id.to_string()))
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a new upload session
    pub async fn init(&self, request: InitRequest) -> Result<SessionDescriptor, UploadError> {
        let config = &self.inner.config;

        let file_name = request.file_name.trim();
        if file_name.is_empty() {
            return Err(UploadError::Validation("file name must not be empty".to_string()));
        }
        if request.file_size == 0 {
            return Err(UploadError::Validation("file size must be greater than 0".to_string()));
        }
        if request.total_chunks == 0 {
            return Err(UploadError::Validation("chunk count must be greater than 0".to_string()));
        }
        let owner_id = request.owner_id.trim();
        if owner_id.is_empty() {
            return Err(UploadError::Validation("owner id must not be empty".to_string()));
        }
        if request.file_size > config.max_file_size {
            return Err(UploadError::FileTooLarge {
                size: request.file_size,
                max: config.max_file_size,
            });
        }
        if u64::from(request.total_chunks) > request.file_size {
            return Err(UploadError::Validation(format!(
                "chunk count {} exceeds file size {}",
                request.total_chunks, request.file_size
            )));
        }
        if request.file_size.div_ceil(config.max_chunk_size) > u64::from(u32::MAX) {
            return Err(UploadError::Validation(
                "file needs more chunks than supported".to_string(),
            ));
        }

        let file_hash = match request.md5_hash.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(hash) if config.hash_algorithm.is_valid_digest(hash) => {
                Some(hash.to_ascii_lowercase())
            }
            Some(hash) => {
                return Err(UploadError::Validation(format!(
                    "file hash {:?} is not a valid {} digest",
                    hash, config.hash_algorithm
                )))
            }
        };

        let layout = ChunkLayout::compute(
            request.file_size,
            request.total_chunks,
            config.max_chunk_size,
        );

        let session = UploadSession::new(
            file_name.to_string(),
            request.file_size,
            layout,
            file_hash,
            owner_id.to_string(),
            config.session_ttl(),
            Utc::now(),
        );
        let id = session.id;

        self.inner.sessions.insert(&session).await?;

        if let Err(e) = self.inner.chunks.reserve(id).await {
            tracing::error!(session_id = %id, error = %e, "Failed to reserve chunk storage");
            if let Err(rollback) = self.inner.sessions.delete_many(&[id]).await {
                tracing::error!(
                    session_id = %id,
                    error = %rollback,
                    "Failed to remove session after storage error"
                );
            }
            return Err(UploadError::Internal(
                "failed to allocate chunk storage".to_string(),
            ));
        }

        tracing::info!(
            session_id = %id,
            file_name = %session.file_name,
            file_size = session.total_size,
            chunk_size = session.chunk_size,
            chunks = session.total_chunks,
            owner_id = %session.owner_id,
            "Created upload session"
        );

        Ok(SessionDescriptor::from(&session))
    }

    /// Ingest one chunk.
    ///
    /// Re-sending an index that is already recorded succeeds without
    /// touching the stored bytes.
    pub async fn upload_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: u32,
        data: Bytes,
        chunk_hash: Option<String>,
    ) -> Result<ChunkAck, UploadError> {
        let session = self.load(upload_id).await?;
        ensure_open(&session, Utc::now())?;

        if chunk_index >= session.total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: session.total_chunks,
            });
        }
        if data.is_empty() {
            return Err(UploadError::Validation(format!("chunk {} is empty", chunk_index)));
        }

        if self.inner.chunks.contains(upload_id, chunk_index).await? {
            let uploaded = self.inner.chunks.count(upload_id).await?;
            tracing::debug!(
                session_id = %upload_id,
                chunk_index = chunk_index,
                "Chunk already received"
            );
            return Ok(ack(&session, chunk_index, true, uploaded));
        }

        let chunk_hash = chunk_hash
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty());

        if let Some(expected) = chunk_hash.as_deref() {
            let algorithm = self.inner.config.hash_algorithm;
            let payload = data.clone();
            let actual = tokio::task::spawn_blocking(move || compute_hash(algorithm, &payload))
                .await
                .map_err(|e| UploadError::Internal(format!("hash task failed: {}", e)))?;

            if !hashes_match(expected, &actual) {
                tracing::warn!(
                    session_id = %upload_id,
                    chunk_index = chunk_index,
                    expected = %expected,
                    actual = %actual,
                    "Chunk hash mismatch"
                );
                return Err(UploadError::ChunkHashMismatch {
                    index: chunk_index,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let staged = match self.inner.chunks.stage(upload_id, chunk_index, &data).await {
            Ok(staged) => staged,
            Err(e) => {
                // The scope disappears when a concurrent cancel or sweep wins
                let current = self.load(upload_id).await?;
                ensure_open(&current, Utc::now())?;
                return Err(e);
            }
        };

        let (_guard, current) = match self.lock_session(upload_id).await {
            Ok(locked) => locked,
            Err(e) => {
                self.inner.chunks.discard(staged).await;
                return Err(e);
            }
        };
        if let Err(e) = ensure_open(&current, Utc::now()) {
            self.inner.chunks.discard(staged).await;
            return Err(e);
        }

        let inserted = self.inner.chunks.commit(staged, chunk_hash).await?;
        let uploaded = self.inner.chunks.count(upload_id).await?;
        if inserted {
            self.inner
                .sessions
                .set_uploaded_chunks(upload_id, uploaded, Utc::now())
                .await?;
        }

        tracing::debug!(
            session_id = %upload_id,
            chunk_index = chunk_index,
            size = data.len(),
            chunks_received = uploaded,
            total_chunks = current.total_chunks,
            duplicate = !inserted,
            "Chunk uploaded"
        );

        Ok(ack(&current, chunk_index, !inserted, uploaded))
    }

    /// Assemble all chunks into the final artifact
    pub async fn merge(&self, upload_id: Uuid) -> Result<MergeOutcome, UploadError> {
        let (_guard, session) = self.lock_session(upload_id).await?;
        ensure_open(&session, Utc::now())?;

        let uploaded = self.inner.chunks.count(upload_id).await?;
        if uploaded != session.total_chunks {
            return Err(UploadError::IncompleteUpload {
                uploaded,
                total: session.total_chunks,
            });
        }

        let records = self.inner.chunks.records(upload_id).await?;

        tracing::info!(
            session_id = %upload_id,
            file_name = %session.file_name,
            chunks = records.len(),
            "Assembling file from chunks"
        );

        let artifact = match self
            .inner
            .writer
            .assemble(
                &session.file_name,
                &records,
                self.inner.chunks.storage(),
                session.file_hash.as_deref(),
            )
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                if let (Some(index), UploadError::Storage(_)) = (e.chunk_index, &e.error) {
                    self.flag_unreadable_chunk(upload_id, index).await;
                }
                tracing::warn!(session_id = %upload_id, error = %e.error, "Merge failed");
                return Err(e.into());
            }
        };

        let final_path = artifact.path.to_string_lossy().to_string();
        if let Err(e) = self
            .inner
            .sessions
            .mark_completed(upload_id, &final_path, Utc::now())
            .await
        {
            remove_orphan_artifact(&artifact.path).await;
            return Err(e);
        }
        self.inner.locks.release(upload_id);

        match self.inner.chunks.purge(upload_id).await {
            Ok(files) => {
                tracing::debug!(session_id = %upload_id, files = files, "Purged merged chunks")
            }
            Err(e) => tracing::warn!(
                session_id = %upload_id,
                error = %e,
                "Failed to purge chunks after merge"
            ),
        }

        tracing::info!(
            session_id = %upload_id,
            final_path = %final_path,
            size = artifact.size,
            "Upload merged"
        );

        Ok(MergeOutcome {
            upload_id: upload_id.to_string(),
            final_path,
            size: artifact.size,
            hash: artifact.hash,
        })
    }

    /// Cancel a session and purge its chunks
    pub async fn cancel(&self, upload_id: Uuid) -> Result<(), UploadError> {
        let (_guard, session) = self.lock_session(upload_id).await?;
        match session.status {
            SessionStatus::Completed => return Err(UploadError::invalid_state(&session)),
            SessionStatus::Cancelled => {}
            SessionStatus::InProgress => {
                self.inner
                    .sessions
                    .mark_cancelled(upload_id, Utc::now())
                    .await?;
            }
        }

        self.inner.locks.release(upload_id);

        // Leftover chunks are reclaimed by the sweeper
        match self.inner.chunks.purge(upload_id).await {
            Ok(files) => tracing::info!(
                session_id = %upload_id,
                file_name = %session.file_name,
                files = files,
                "Upload session cancelled"
            ),
            Err(e) => tracing::warn!(
                session_id = %upload_id,
                file_name = %session.file_name,
                error = %e,
                "Upload session cancelled, failed to purge chunks"
            ),
        }

        Ok(())
    }

    /// Reclaim sessions past their expiry
    pub async fn cleanup_expired(&self) -> Result<usize, UploadError> {
        self.inner.sweeper.sweep().await
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Session descriptor with progress percentage and status label
    pub async fn progress(&self, upload_id: Uuid) -> Result<SessionDescriptor, UploadError> {
        let session = self.load(upload_id).await?;
        Ok(SessionDescriptor::from(&session))
    }

    /// Whether a chunk index has been recorded
    pub async fn chunk_exists(&self, upload_id: Uuid, chunk_index: u32) -> Result<bool, UploadError> {
        let session = self.load(upload_id).await?;
        if chunk_index >= session.total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: session.total_chunks,
            });
        }
        self.inner.chunks.contains(upload_id, chunk_index).await
    }

    /// Indices still to be uploaded, ascending
    pub async fn missing_chunks(&self, upload_id: Uuid) -> Result<Vec<u32>, UploadError> {
        let session = self.load(upload_id).await?;
        if session.status.is_terminal() {
            return Err(UploadError::invalid_state(&session));
        }
        self.inner
            .chunks
            .missing(upload_id, session.total_chunks)
            .await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load(&self, upload_id: Uuid) -> Result<UploadSession, UploadError> {
        self.inner
            .sessions
            .get(upload_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))
    }

    /// Take the session lock and load the session under it.
    ///
    /// Unknown and terminal sessions leave no entry behind in the lock table.
    async fn lock_session(
        &self,
        upload_id: Uuid,
    ) -> Result<(OwnedMutexGuard<()>, UploadSession), UploadError> {
        let guard = self.inner.locks.acquire(upload_id).await;
        match self.inner.sessions.get(upload_id).await? {
            Some(session) => {
                if session.status.is_terminal() {
                    self.inner.locks.release(upload_id);
                }
                Ok((guard, session))
            }
            None => {
                self.inner.locks.release(upload_id);
                Err(UploadError::SessionNotFound(upload_id.to_string()))
            }
        }
    }

    /// Mark a chunk whose bytes could not be read so the client can re-send it
    async fn flag_unreadable_chunk(&self, upload_id: Uuid, chunk_index: u32) {
        match self.recount_without(upload_id, chunk_index).await {
            Ok(uploaded) => tracing::warn!(
                session_id = %upload_id,
                chunk_index = chunk_index,
                chunks_received = uploaded,
                "Chunk bytes unreadable, marked failed"
            ),
            Err(e) => tracing::error!(
                session_id = %upload_id,
                chunk_index = chunk_index,
                error = %e,
                "Failed to mark chunk failed"
            ),
        }
    }

    async fn recount_without(&self, upload_id: Uuid, chunk_index: u32) -> Result<u32, UploadError> {
        self.inner.chunks.mark_failed(upload_id, chunk_index).await?;
        let uploaded = self.inner.chunks.count(upload_id).await?;
        self.inner
            .sessions
            .set_uploaded_chunks(upload_id, uploaded, Utc::now())
            .await?;
        Ok(uploaded)
    }
}

/// Reject sessions that no longer accept chunks or merges
fn ensure_open(session: &UploadSession, now: DateTime<Utc>) -> Result<(), UploadError> {
    if session.status.is_terminal() {
        return Err(UploadError::invalid_state(session));
    }
    if session.is_expired_at(now) {
        return Err(UploadError::SessionExpired(session.id.to_string()));
    }
    Ok(())
}

fn ack(session: &UploadSession, chunk_index: u32, duplicate: bool, uploaded: u32) -> ChunkAck {
    ChunkAck {
        chunk_index,
        duplicate,
        uploaded_chunks: uploaded,
        total_chunks: session.total_chunks,
        complete: uploaded == session.total_chunks,
    }
}

async fn remove_orphan_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove orphaned artifact");
    }
}

// ============================================================================
// Tests
// ============================================================================
