//! Chunk Store
//!
//! Temporary storage for uploaded chunks before assembly. Split into two
//! seams so each can be backed by a different engine:
//! - [`ChunkIndex`]: chunk records, one per `(session, index)`
//! - [`ChunkStorage`]: raw chunk bytes, one private scope per session

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{ChunkRecord, ChunkStatus, UploadError};

// ============================================================================
// Chunk Index Trait
// ============================================================================

/// Trait for chunk metadata backends
#[async_trait::async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Insert a record. Returns `false` if an OK record already exists for
    /// the same `(session, index)`; a FAILED record is replaced.
    async fn insert(&self, record: &ChunkRecord) -> Result<bool, UploadError>;

    /// Whether an OK record exists
    async fn exists(&self, session_id: Uuid, chunk_index: u32) -> Result<bool, UploadError>;

    /// Number of distinct OK indices
    async fn count(&self, session_id: Uuid) -> Result<u32, UploadError>;

    /// OK records, ascending by index
    async fn list(&self, session_id: Uuid) -> Result<Vec<ChunkRecord>, UploadError>;

    /// Flag a record whose bytes turned out to be unusable
    async fn mark_failed(&self, session_id: Uuid, chunk_index: u32) -> Result<(), UploadError>;

    /// Delete every record of a session
    async fn delete_for_session(&self, session_id: Uuid) -> Result<usize, UploadError>;
}

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Chunk bytes written but not yet visible under their final name
#[derive(Debug)]
pub struct StagedChunk {
    pub session_id: Uuid,
    pub chunk_index: u32,
    pub size: u64,
    staging_path: PathBuf,
}

impl StagedChunk {
    pub fn new(session_id: Uuid, chunk_index: u32, size: u64, staging_path: PathBuf) -> Self {
        Self {
            session_id,
            chunk_index,
            size,
            staging_path,
        }
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }
}

/// Trait for chunk byte backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Allocate the storage scope of a new session
    async fn reserve(&self, session_id: Uuid) -> Result<(), UploadError>;

    /// Durably write chunk bytes under a unique staging name
    async fn stage(
        &self,
        session_id: Uuid,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<StagedChunk, UploadError>;

    /// Move staged bytes to their final location and return it
    async fn promote(&self, staged: StagedChunk) -> Result<String, UploadError>;

    /// Drop staged bytes that will not be recorded
    async fn discard(&self, staged: StagedChunk);

    /// Open stored chunk bytes for reading
    async fn open(
        &self,
        storage_path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, UploadError>;

    /// Delete the whole scope of a session, returning the number of files removed
    async fn purge(&self, session_id: Uuid) -> Result<usize, UploadError>;
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Chunk store combining a record index with a byte backend
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    index: Arc<dyn ChunkIndex>,
    storage: Arc<dyn ChunkStorage>,
}

impl ChunkStore {
    pub fn new(index: Arc<dyn ChunkIndex>, storage: Arc<dyn ChunkStorage>) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner { index, storage }),
        }
    }

    /// Create with in-memory records and local filesystem bytes
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::new(
            Arc::new(MemoryChunkIndex::new()),
            Arc::new(LocalChunkStorage::new(base_path)),
        )
    }

    pub fn index(&self) -> &dyn ChunkIndex {
        self.inner.index.as_ref()
    }

    pub fn storage(&self) -> &dyn ChunkStorage {
        self.inner.storage.as_ref()
    }

    pub async fn reserve(&self, session_id: Uuid) -> Result<(), UploadError> {
        self.inner.storage.reserve(session_id).await
    }

    pub async fn stage(
        &self,
        session_id: Uuid,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<StagedChunk, UploadError> {
        self.inner.storage.stage(session_id, chunk_index, data).await
    }

    pub async fn discard(&self, staged: StagedChunk) {
        self.inner.storage.discard(staged).await
    }

    /// Record staged bytes unless the index is already present.
    ///
    /// Returns `false` when an earlier write won; the staged bytes are
    /// discarded in that case. Callers serialize commits per session.
    pub async fn commit(
        &self,
        staged: StagedChunk,
        chunk_hash: Option<String>,
    ) -> Result<bool, UploadError> {
        let (session_id, chunk_index, size) = (staged.session_id, staged.chunk_index, staged.size);

        if self.inner.index.exists(session_id, chunk_index).await? {
            self.inner.storage.discard(staged).await;
            return Ok(false);
        }

        let storage_path = self.inner.storage.promote(staged).await?;
        let record = ChunkRecord {
            session_id,
            chunk_index,
            chunk_size: size,
            storage_path,
            chunk_hash,
            status: ChunkStatus::Ok,
            created_at: Utc::now(),
        };

        self.inner.index.insert(&record).await
    }

    /// Flag a recorded chunk as unusable so it can be uploaded again
    pub async fn mark_failed(&self, session_id: Uuid, chunk_index: u32) -> Result<(), UploadError> {
        self.inner.index.mark_failed(session_id, chunk_index).await
    }

    pub async fn contains(&self, session_id: Uuid, chunk_index: u32) -> Result<bool, UploadError> {
        self.inner.index.exists(session_id, chunk_index).await
    }

    pub async fn count(&self, session_id: Uuid) -> Result<u32, UploadError> {
        self.inner.index.count(session_id).await
    }

    /// Records sorted ascending by chunk index
    pub async fn records(&self, session_id: Uuid) -> Result<Vec<ChunkRecord>, UploadError> {
        let mut records = self.inner.index.list(session_id).await?;
        records.sort_by_key(|r| r.chunk_index);
        Ok(records)
    }

    /// Indices in `0..total_chunks` without a record
    pub async fn missing(&self, session_id: Uuid, total_chunks: u32) -> Result<Vec<u32>, UploadError> {
        let present: std::collections::HashSet<u32> = self
            .inner
            .index
            .list(session_id)
            .await?
            .into_iter()
            .map(|r| r.chunk_index)
            .collect();

        Ok((0..total_chunks).filter(|i| !present.contains(i)).collect())
    }

    /// Delete all records and bytes of a session
    pub async fn purge(&self, session_id: Uuid) -> Result<usize, UploadError> {
        let records = self.inner.index.delete_for_session(session_id).await;
        let files = self.inner.storage.purge(session_id).await;

        if let Ok(count) = records {
            tracing::debug!(session_id = %session_id, records = count, "Deleted chunk records");
        }

        records?;
        files
    }
}

// ============================================================================
// In-Memory Index
// ============================================================================

/// Chunk index backed by a map
#[derive(Default)]
pub struct MemoryChunkIndex {
    chunks: RwLock<HashMap<Uuid, BTreeMap<u32, ChunkRecord>>>,
}

impl MemoryChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ChunkIndex for MemoryChunkIndex {
    async fn insert(&self, record: &ChunkRecord) -> Result<bool, UploadError> {
        let mut chunks = self.chunks.write().await;
        let session = chunks.entry(record.session_id).or_default();

        let occupied = session
            .get(&record.chunk_index)
            .is_some_and(|r| r.status == ChunkStatus::Ok);
        if occupied {
            return Ok(false);
        }

        session.insert(record.chunk_index, record.clone());
        Ok(true)
    }

    async fn exists(&self, session_id: Uuid, chunk_index: u32) -> Result<bool, UploadError> {
        let chunks = self.chunks.read().await;
        Ok(chunks
            .get(&session_id)
            .and_then(|s| s.get(&chunk_index))
            .is_some_and(|r| r.status == ChunkStatus::Ok))
    }

    async fn count(&self, session_id: Uuid) -> Result<u32, UploadError> {
        let chunks = self.chunks.read().await;
        let count = chunks
            .get(&session_id)
            .map(|s| s.values().filter(|r| r.status == ChunkStatus::Ok).count())
            .unwrap_or(0);
        Ok(count as u32)
    }

    async fn list(&self, session_id: Uuid) -> Result<Vec<ChunkRecord>, UploadError> {
        let chunks = self.chunks.read().await;
        Ok(chunks
            .get(&session_id)
            .map(|s| {
                s.values()
                    .filter(|r| r.status == ChunkStatus::Ok)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_failed(&self, session_id: Uuid, chunk_index: u32) -> Result<(), UploadError> {
        let mut chunks = self.chunks.write().await;
        if let Some(record) = chunks
            .get_mut(&session_id)
            .and_then(|s| s.get_mut(&chunk_index))
        {
            record.status = ChunkStatus::Failed;
        }
        Ok(())
    }

    async fn delete_for_session(&self, session_id: Uuid) -> Result<usize, UploadError> {
        let mut chunks = self.chunks.write().await;
        Ok(chunks.remove(&session_id).map(|s| s.len()).unwrap_or(0))
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage: `<base>/<session>/<index>.chunk`
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.base_path.join(session_id.to_string())
    }

    fn chunk_path(&self, session_id: Uuid, chunk_index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{:08}.chunk", chunk_index))
    }

    fn staging_path(&self, session_id: Uuid, chunk_index: u32) -> PathBuf {
        self.session_dir(session_id).join(format!(
            "{:08}.{}.part",
            chunk_index,
            Uuid::new_v4().simple()
        ))
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn reserve(&self, session_id: Uuid) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(self.session_dir(session_id))
            .await
            .map_err(|e| UploadError::Storage(format!("Failed to create chunk directory: {}", e)))
    }

    async fn stage(
        &self,
        session_id: Uuid,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<StagedChunk, UploadError> {
        let staging_path = self.staging_path(session_id, chunk_index);

        let write = async {
            let mut file = tokio::fs::File::create(&staging_path).await?;
            file.write_all(data).await?;
            file.sync_all().await
        };

        if let Err(e) = write.await {
            remove_quietly(&staging_path).await;
            return Err(UploadError::Storage(format!(
                "Failed to write chunk {}: {}",
                chunk_index, e
            )));
        }

        Ok(StagedChunk::new(
            session_id,
            chunk_index,
            data.len() as u64,
            staging_path,
        ))
    }

    async fn promote(&self, staged: StagedChunk) -> Result<String, UploadError> {
        let final_path = self.chunk_path(staged.session_id, staged.chunk_index);

        if let Err(e) = tokio::fs::rename(staged.staging_path(), &final_path).await {
            remove_quietly(staged.staging_path()).await;
            return Err(UploadError::Storage(format!(
                "Failed to store chunk {}: {}",
                staged.chunk_index, e
            )));
        }

        Ok(final_path.to_string_lossy().to_string())
    }

    async fn discard(&self, staged: StagedChunk) {
        remove_quietly(staged.staging_path()).await;
    }

    async fn open(
        &self,
        storage_path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, UploadError> {
        let file = tokio::fs::File::open(storage_path).await.map_err(|e| {
            UploadError::Storage(format!("Failed to open chunk {}: {}", storage_path, e))
        })?;
        Ok(Box::new(file))
    }

    async fn purge(&self, session_id: Uuid) -> Result<usize, UploadError> {
        let session_dir = self.session_dir(session_id);
        let mut count = 0;
        let mut attempt = 1;

        loop {
            match remove_files(&session_dir).await? {
                Some(removed) => count += removed,
                None => return Ok(count),
            }

            // A stage racing the purge can refill the directory
            match tokio::fs::remove_dir(&session_dir).await {
                Ok(()) => return Ok(count),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(count),
                Err(e) if attempt < PURGE_ATTEMPTS => {
                    tracing::debug!(session_id = %session_id, error = %e, "Retrying chunk purge");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Passes over a session directory before `purge` gives up
const PURGE_ATTEMPTS: u32 = 3;

/// Remove every file in `dir`, `None` when the directory does not exist
async fn remove_files(dir: &Path) -> std::io::Result<Option<usize>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => count += 1,
            // Discarded or promoted concurrently
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(count))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn read_all(store: &ChunkStore, record: &ChunkRecord) -> Vec<u8> {
        let mut reader = store.storage().open(&record.storage_path).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_local_chunk_storage() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        store.reserve(session_id).await.unwrap();

        let staged = store.stage(session_id, 0, b"test chunk data").await.unwrap();
        assert!(store.commit(staged, None).await.unwrap());

        assert!(store.contains(session_id, 0).await.unwrap());
        assert!(!store.contains(session_id, 1).await.unwrap());
        assert_eq!(store.count(session_id).await.unwrap(), 1);

        let records = store.records(session_id).await.unwrap();
        assert_eq!(records[0].chunk_size, 15);
        assert!(records[0].storage_path.ends_with("00000000.chunk"));
        assert_eq!(read_all(&store, &records[0]).await, b"test chunk data");

        let deleted = store.purge(session_id).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count(session_id).await.unwrap(), 0);
        assert!(!temp_dir.path().join(session_id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        store.reserve(session_id).await.unwrap();

        let first = store.stage(session_id, 0, b"first").await.unwrap();
        let second = store.stage(session_id, 0, b"second").await.unwrap();

        assert!(store.commit(first, None).await.unwrap());
        assert!(!store.commit(second, None).await.unwrap());

        let records = store.records(session_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(read_all(&store, &records[0]).await, b"first");

        // Only the promoted chunk is left in the scope
        assert_eq!(store.purge(session_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_failed_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        store.reserve(session_id).await.unwrap();

        for index in [0, 2] {
            let staged = store.stage(session_id, index, b"x").await.unwrap();
            store.commit(staged, None).await.unwrap();
        }
        assert_eq!(store.missing(session_id, 4).await.unwrap(), vec![1, 3]);

        store.index().mark_failed(session_id, 2).await.unwrap();
        assert_eq!(store.count(session_id).await.unwrap(), 1);
        assert_eq!(store.missing(session_id, 4).await.unwrap(), vec![1, 2, 3]);

        // A failed index can be uploaded again
        let staged = store.stage(session_id, 2, b"y").await.unwrap();
        assert!(store.commit(staged, None).await.unwrap());
        assert_eq!(store.count(session_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stage_without_scope_fails() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalChunkStorage::new(temp_dir.path().to_path_buf());

        let result = storage.stage(Uuid::new_v4(), 0, b"data").await;
        assert!(matches!(result, Err(UploadError::Storage(_))));
    }

    #[tokio::test]
    async fn test_purge_removes_in_flight_stages() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        store.reserve(session_id).await.unwrap();

        let committed = store.stage(session_id, 0, b"abc").await.unwrap();
        store.commit(committed, None).await.unwrap();
        let in_flight = store.stage(session_id, 1, b"def").await.unwrap();
        assert!(in_flight.staging_path().exists());

        assert_eq!(store.purge(session_id).await.unwrap(), 2);
        assert!(!temp_dir.path().join(session_id.to_string()).exists());

        // The late writer finds its file gone and its scope closed
        store.discard(in_flight).await;
        assert!(store.stage(session_id, 2, b"ghi").await.is_err());
        assert_eq!(store.purge(session_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_unknown_session() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        assert_eq!(store.purge(Uuid::new_v4()).await.unwrap(), 0);
    }
}
