//! Chunk index database operations

use sqlx::SqlitePool;
use uuid::Uuid;

use super::{decode_time, decode_unsigned, decode_uuid, encode_time};
use crate::upload::{ChunkIndex, ChunkRecord, ChunkStatus, UploadError};

/// Chunk record row
#[derive(Debug, Clone, sqlx::FromRow)]
struct ChunkRow {
    session_id: String,
    chunk_index: i64,
    chunk_size: i64,
    storage_path: String,
    chunk_hash: Option<String>,
    status: String,
    created_at: String,
}

impl TryFrom<ChunkRow> for ChunkRecord {
    type Error = UploadError;

    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        Ok(ChunkRecord {
            session_id: decode_uuid(&row.session_id)?,
            chunk_index: decode_unsigned("chunk_index", row.chunk_index)?,
            chunk_size: decode_unsigned("chunk_size", row.chunk_size)?,
            storage_path: row.storage_path,
            chunk_hash: row.chunk_hash,
            status: row.status.parse()?,
            created_at: decode_time(&row.created_at)?,
        })
    }
}

/// SQLite-backed chunk index
#[derive(Clone)]
pub struct SqliteChunkIndex {
    pool: SqlitePool,
}

impl SqliteChunkIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ChunkIndex for SqliteChunkIndex {
    async fn insert(&self, record: &ChunkRecord) -> Result<bool, UploadError> {
        let chunk_size = i64::try_from(record.chunk_size)
            .map_err(|_| UploadError::Database(format!("chunk size out of range: {}", record.chunk_size)))?;

        // Only a failed row may be replaced
        let result = sqlx::query(
            r#"
            INSERT INTO upload_chunks (session_id, chunk_index, chunk_size, storage_path,
                                       chunk_hash, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, chunk_index) DO UPDATE SET
                chunk_size = excluded.chunk_size,
                storage_path = excluded.storage_path,
                chunk_hash = excluded.chunk_hash,
                status = excluded.status,
                created_at = excluded.created_at
            WHERE upload_chunks.status = 'failed'
            "#,
        )
        .bind(record.session_id.to_string())
        .bind(i64::from(record.chunk_index))
        .bind(chunk_size)
        .bind(&record.storage_path)
        .bind(&record.chunk_hash)
        .bind(record.status.as_str())
        .bind(encode_time(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, session_id: Uuid, chunk_index: u32) -> Result<bool, UploadError> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM upload_chunks
            WHERE session_id = ? AND chunk_index = ? AND status = ?
            "#,
        )
        .bind(session_id.to_string())
        .bind(i64::from(chunk_index))
        .bind(ChunkStatus::Ok.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn count(&self, session_id: Uuid) -> Result<u32, UploadError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM upload_chunks WHERE session_id = ? AND status = ?",
        )
        .bind(session_id.to_string())
        .bind(ChunkStatus::Ok.as_str())
        .fetch_one(&self.pool)
        .await?;

        decode_unsigned("count", count)
    }

    async fn list(&self, session_id: Uuid) -> Result<Vec<ChunkRecord>, UploadError> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT session_id, chunk_index, chunk_size, storage_path, chunk_hash, status, created_at
            FROM upload_chunks
            WHERE session_id = ? AND status = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(session_id.to_string())
        .bind(ChunkStatus::Ok.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChunkRecord::try_from).collect()
    }

    async fn mark_failed(&self, session_id: Uuid, chunk_index: u32) -> Result<(), UploadError> {
        sqlx::query(
            "UPDATE upload_chunks SET status = ? WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(ChunkStatus::Failed.as_str())
        .bind(session_id.to_string())
        .bind(i64::from(chunk_index))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_for_session(&self, session_id: Uuid) -> Result<usize, UploadError> {
        let result = sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use chrono::Utc;

    async fn index() -> SqliteChunkIndex {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        SqliteChunkIndex::new(pool)
    }

    fn record(session_id: Uuid, chunk_index: u32, storage_path: &str) -> ChunkRecord {
        ChunkRecord {
            session_id,
            chunk_index,
            chunk_size: 4,
            storage_path: storage_path.to_string(),
            chunk_hash: None,
            status: ChunkStatus::Ok,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_first_record_wins() {
        let index = index().await;
        let session_id = Uuid::new_v4();

        assert!(index.insert(&record(session_id, 0, "/a")).await.unwrap());
        assert!(!index.insert(&record(session_id, 0, "/b")).await.unwrap());

        let records = index.list(session_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].storage_path, "/a");
        assert_eq!(index.count(session_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_record_can_be_replaced() {
        let index = index().await;
        let session_id = Uuid::new_v4();
        index.insert(&record(session_id, 3, "/old")).await.unwrap();

        index.mark_failed(session_id, 3).await.unwrap();
        assert!(!index.exists(session_id, 3).await.unwrap());
        assert_eq!(index.count(session_id).await.unwrap(), 0);

        assert!(index.insert(&record(session_id, 3, "/new")).await.unwrap());
        let records = index.list(session_id).await.unwrap();
        assert_eq!(records[0].storage_path, "/new");
        assert_eq!(records[0].status, ChunkStatus::Ok);
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_scoped() {
        let index = index().await;
        let session_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        for i in [2, 0, 1] {
            index.insert(&record(session_id, i, "/x")).await.unwrap();
        }
        index.insert(&record(other, 0, "/y")).await.unwrap();

        let order: Vec<u32> = index
            .list(session_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.chunk_index)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);

        assert_eq!(index.delete_for_session(session_id).await.unwrap(), 3);
        assert_eq!(index.count(session_id).await.unwrap(), 0);
        assert_eq!(index.count(other).await.unwrap(), 1);
    }
}
