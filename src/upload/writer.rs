//! Artifact Writer
//!
//! Streams recorded chunks, in index order, into a freshly named file in the
//! artifact directory and verifies the declared whole-file digest.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use super::chunk_store::ChunkStorage;
use super::hashing::{hashes_match, Digester, HashAlgorithm};
use super::types::{ChunkRecord, UploadError};

/// Copy buffer size
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Budget for the client-supplied part of an artifact name, in bytes.
/// Filesystems cap a name at 255 bytes and the prefix takes 27.
const MAX_NAME_BYTES: usize = 180;

/// Extensions up to this length survive truncation
const MAX_EXTENSION_BYTES: usize = 16;

/// An assembled, verified file
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
}

/// Failure while assembling, with the chunk at fault when known
#[derive(Debug)]
pub struct AssembleError {
    pub chunk_index: Option<u32>,
    pub error: UploadError,
}

impl From<AssembleError> for UploadError {
    fn from(e: AssembleError) -> Self {
        e.error
    }
}

/// Writes merged artifacts into a shared directory
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    artifact_dir: PathBuf,
    algorithm: HashAlgorithm,
}

impl ArtifactWriter {
    pub fn new(artifact_dir: PathBuf, algorithm: HashAlgorithm) -> Self {
        Self {
            artifact_dir,
            algorithm,
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Collision-resistant artifact path for `file_name`
    fn artifact_path(&self, file_name: &str) -> PathBuf {
        let name = format!(
            "{}_{}_{}",
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..12],
            sanitize_file_name(file_name)
        );
        self.artifact_dir.join(name)
    }

    /// Assemble `chunks` into a new artifact.
    ///
    /// `chunks` must already be sorted by index. Any failure removes the
    /// partially written file.
    pub async fn assemble(
        &self,
        file_name: &str,
        chunks: &[ChunkRecord],
        storage: &dyn ChunkStorage,
        expected_hash: Option<&str>,
    ) -> Result<Artifact, AssembleError> {
        tokio::fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|e| AssembleError {
                chunk_index: None,
                error: UploadError::Storage(format!("Failed to create artifact directory: {}", e)),
            })?;

        let path = self.artifact_path(file_name);

        let result = self.write_chunks(&path, chunks, storage).await;
        let (size, hash) = match result {
            Ok(written) => written,
            Err(e) => {
                remove_artifact(&path).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected_hash {
            if !hashes_match(expected, &hash) {
                remove_artifact(&path).await;
                return Err(AssembleError {
                    chunk_index: None,
                    error: UploadError::IntegrityMismatch {
                        expected: expected.to_string(),
                        actual: hash,
                    },
                });
            }
        }

        Ok(Artifact { path, size, hash })
    }

    async fn write_chunks(
        &self,
        path: &Path,
        chunks: &[ChunkRecord],
        storage: &dyn ChunkStorage,
    ) -> Result<(u64, String), AssembleError> {
        let file_error = |e: std::io::Error| AssembleError {
            chunk_index: None,
            error: UploadError::Storage(format!("Failed to write artifact: {}", e)),
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(file_error)?;
        let mut out = BufWriter::new(file);

        let mut digester = Digester::new(self.algorithm);
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut size = 0u64;

        for chunk in chunks {
            let chunk_error = |error: UploadError| AssembleError {
                chunk_index: Some(chunk.chunk_index),
                error,
            };

            let mut reader = storage.open(&chunk.storage_path).await.map_err(chunk_error)?;
            loop {
                let n = reader
                    .read(&mut buf)
                    .await
                    .map_err(|e| chunk_error(e.into()))?;
                if n == 0 {
                    break;
                }
                digester.update(&buf[..n]);
                out.write_all(&buf[..n]).await.map_err(file_error)?;
                size += n as u64;
            }
        }

        out.flush().await.map_err(file_error)?;
        out.get_ref().sync_all().await.map_err(file_error)?;

        Ok((size, digester.finalize_hex()))
    }
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
        }
    }
}

/// Keep only the final path component and drop characters that are unsafe
/// in file names
fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);

    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.trim_matches('.') {
        "" => "file".to_string(),
        _ => truncate_file_name(&cleaned),
    }
}

/// Shorten `name` to [`MAX_NAME_BYTES`] on a char boundary, keeping a short
/// extension intact
fn truncate_file_name(name: &str) -> String {
    if name.len() <= MAX_NAME_BYTES {
        return name.to_string();
    }

    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= MAX_EXTENSION_BYTES => name.split_at(dot),
        _ => (name, ""),
    };

    let budget = MAX_NAME_BYTES - extension.len();
    let end = stem
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= budget)
        .last()
        .unwrap_or(0);

    format!("{}{}", &stem[..end], extension)
}

// ============================================================================
// Tests
// ============================================================================
