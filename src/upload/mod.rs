//! Chunked Upload Module
//!
//! Implements reliable large file uploads with:
//! - Server-computed chunk layout
//! - Per-chunk and whole-file digest verification (MD5 or SHA-256)
//! - Idempotent, resumable chunk ingestion
//! - Ordered reassembly into a final artifact
//!
//! Protocol Flow:
//! 1. Client initiates a session with file name, size and desired chunk count
//! 2. Server answers with the effective chunk size and count
//! 3. Client uploads chunks in any order, re-sending freely
//! 4. Client asks for a merge; the server assembles and verifies the file
//!
//! Abandoned sessions are reclaimed by the [`ExpirationSweeper`].

pub mod chunk_store;
pub mod hashing;
pub mod locks;
pub mod service;
pub mod session;
pub mod sweeper;
pub mod types;
pub mod writer;

pub use chunk_store::{ChunkIndex, ChunkStorage, ChunkStore, LocalChunkStorage, MemoryChunkIndex};
pub use hashing::{compute_hash, hashes_match, HashAlgorithm};
pub use service::UploadService;
pub use session::{MemorySessionStore, SessionStore};
pub use sweeper::ExpirationSweeper;
pub use types::*;
pub use writer::ArtifactWriter;
