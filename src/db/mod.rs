//! Database module for SQLite persistence
//!
//! Stores upload-session metadata and the chunk index so sessions survive
//! restarts. Chunk bytes stay in chunk storage.

mod chunks;
mod schema;
mod sessions;

pub use chunks::SqliteChunkIndex;
pub use schema::initialize_schema;
pub use sessions::SqliteSessionStore;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};

use crate::upload::UploadError;

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, UploadError> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

    let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let mut pool_options = SqlitePoolOptions::new();

    if in_memory {
        // Every connection to an in-memory database sees its own database
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        pool_options = pool_options.max_connections(5);
    }

    let pool = pool_options.connect_with(options).await?;

    // Run migrations
    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Timestamps are stored as fixed-width RFC 3339 text so they order lexically
pub(crate) fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(value: &str) -> Result<DateTime<Utc>, UploadError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| UploadError::Database(format!("invalid timestamp {:?}: {}", value, e)))
}

pub(crate) fn decode_uuid(value: &str) -> Result<uuid::Uuid, UploadError> {
    uuid::Uuid::parse_str(value)
        .map_err(|e| UploadError::Database(format!("invalid id {:?}: {}", value, e)))
}

/// Convert a stored INTEGER back to an unsigned Rust integer
pub(crate) fn decode_unsigned<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, UploadError> {
    T::try_from(value)
        .map_err(|_| UploadError::Database(format!("column {} out of range: {}", column, value)))
}
