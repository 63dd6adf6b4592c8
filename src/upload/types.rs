//! Upload types for the chunked upload protocol

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Default maximum chunk size: 2MB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Default maximum file size: 4GB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Session expiry time: 24 hours
pub const SESSION_EXPIRY_HOURS: i64 = 24;

// ============================================================================
// Init Types
// ============================================================================

/// Request to initiate a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// Number of chunks the client intends to send
    pub total_chunks: u32,

    /// Digest of the complete file
    #[serde(default, alias = "fileHash")]
    pub md5_hash: Option<String>,

    /// Opaque caller identity supplied by the auth layer
    pub owner_id: String,
}

/// Chunk size and count agreed for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl ChunkLayout {
    /// Work out the chunk layout for a file.
    ///
    /// Callers must have checked that both `total_size` and `requested` are
    /// non-zero and that `max_chunk_size` is positive.
    pub fn compute(total_size: u64, requested: u32, max_chunk_size: u64) -> Self {
        let aligned = total_size.div_ceil(max_chunk_size);
        let per_chunk = total_size.div_ceil(u64::from(requested));

        if per_chunk > max_chunk_size {
            // Too few chunks for the limit: re-split at the maximum size
            return Self {
                chunk_size: max_chunk_size,
                total_chunks: aligned as u32,
            };
        }

        if u64::from(requested) == aligned {
            // Client sliced at the standard size already
            return Self {
                chunk_size: max_chunk_size.min(total_size),
                total_chunks: requested,
            };
        }

        Self {
            chunk_size: per_chunk,
            total_chunks: requested,
        }
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub total_size: u64,

    /// Chunk size used for this upload
    pub chunk_size: u64,

    /// Number of chunks expected
    pub total_chunks: u32,

    /// Number of distinct chunks recorded
    pub uploaded_chunks: u32,

    /// Declared digest of the complete file
    pub file_hash: Option<String>,

    /// Opaque caller identity
    pub owner_id: String,

    /// Current status
    pub status: SessionStatus,

    /// Path of the merged artifact, present once completed
    pub final_path: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new in-progress session
    pub fn new(
        file_name: String,
        total_size: u64,
        layout: ChunkLayout,
        file_hash: Option<String>,
        owner_id: String,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name,
            total_size,
            chunk_size: layout.chunk_size,
            total_chunks: layout.total_chunks,
            uploaded_chunks: 0,
            file_hash,
            owner_id,
            status: SessionStatus::InProgress,
            final_path: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Check if session has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.uploaded_chunks) / f64::from(self.total_chunks) * 100.0
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Accepting chunks
    InProgress,
    /// Artifact assembled and verified
    Completed,
    /// Cancelled by the client
    Cancelled,
}

impl SessionStatus {
    /// Stored representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Human readable label
    pub fn label(self) -> &'static str {
        match self {
            Self::InProgress => "Uploading",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Completed and cancelled sessions accept no further chunks or merges
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UploadError::Database(format!("unknown session status: {}", other))),
        }
    }
}

// ============================================================================
// Chunk Types
// ============================================================================

/// Metadata for a stored chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub session_id: Uuid,
    pub chunk_index: u32,

    /// Size in bytes
    pub chunk_size: u64,

    /// Where the bytes live in chunk storage
    pub storage_path: String,

    /// Client-supplied digest, if any
    pub chunk_hash: Option<String>,

    pub status: ChunkStatus,
    pub created_at: DateTime<Utc>,
}

/// Chunk status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Ok,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ChunkStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            other => Err(UploadError::Database(format!("unknown chunk status: {}", other))),
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Session descriptor returned by init and progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: u32,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5_hash: Option<String>,
    pub owner_id: String,
    pub status: SessionStatus,
    pub status_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&UploadSession> for SessionDescriptor {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.id.to_string(),
            file_name: session.file_name.clone(),
            file_size: session.total_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            uploaded_chunks: session.uploaded_chunks,
            progress: session.progress(),
            md5_hash: session.file_hash.clone(),
            owner_id: session.owner_id.clone(),
            status: session.status,
            status_text: session.status.label().to_string(),
            final_path: session.final_path.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
        }
    }
}

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    /// Chunk index that was uploaded
    pub chunk_index: u32,

    /// True when the index was already recorded and nothing was written
    pub duplicate: bool,

    /// Number of distinct chunks recorded so far
    pub uploaded_chunks: u32,

    /// Total chunks expected
    pub total_chunks: u32,

    /// Whether all chunks have been received
    pub complete: bool,
}

/// Response after merging an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub upload_id: String,

    /// Path of the assembled artifact
    pub final_path: String,

    /// Artifact size in bytes
    pub size: u64,

    /// Digest of the artifact
    pub hash: String,
}

// ============================================================================
// Error Types
// ============================================================================

/// Broad error category, stable across variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    State,
    Integrity,
    Internal,
}

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Chunk index out of bounds: {index} (total: {total})")]
    ChunkIndexOutOfBounds { index: u32, total: u32 },

    #[error("Chunk {index} hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("Upload incomplete: {uploaded} of {total} chunks received")]
    IncompleteUpload { uploaded: u32, total: u32 },

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} is {status}")]
    InvalidState { id: String, status: SessionStatus },

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Artifact hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::ChunkIndexOutOfBounds { .. }
            | Self::ChunkHashMismatch { .. }
            | Self::IncompleteUpload { .. }
            | Self::FileTooLarge { .. } => ErrorKind::Validation,
            Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } | Self::SessionExpired(_) => ErrorKind::State,
            Self::IntegrityMismatch { .. } => ErrorKind::Integrity,
            Self::Storage(_) | Self::Database(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ChunkIndexOutOfBounds { .. } => "CHUNK_INDEX_OUT_OF_BOUNDS",
            Self::ChunkHashMismatch { .. } => "CHUNK_HASH_MISMATCH",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::SessionExpired(_) => "SESSION_EXPIRED",
            Self::IntegrityMismatch { .. } => "INTEGRITY_ERROR",
            Self::Storage(_) | Self::Database(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ChunkHashMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SessionExpired(_) => StatusCode::GONE,
            _ => match self.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::State => StatusCode::CONFLICT,
                ErrorKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub(crate) fn invalid_state(session: &UploadSession) -> Self {
        Self::InvalidState {
            id: session.id.to_string(),
            status: session.status,
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<sqlx::Error> for UploadError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
