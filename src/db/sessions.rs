//! Upload session database operations

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqlitePool};
use uuid::Uuid;

use super::{decode_time, decode_unsigned, decode_uuid, encode_time};
use crate::upload::{SessionStatus, SessionStore, UploadError, UploadSession};

/// Upload session row
#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    id: String,
    file_name: String,
    file_size: i64,
    chunk_size: i64,
    total_chunks: i64,
    uploaded_chunks: i64,
    file_hash: Option<String>,
    owner_id: String,
    status: String,
    final_path: Option<String>,
    created_at: String,
    updated_at: String,
    expires_at: String,
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = UploadError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(UploadSession {
            id: decode_uuid(&row.id)?,
            file_name: row.file_name,
            total_size: decode_unsigned("file_size", row.file_size)?,
            chunk_size: decode_unsigned("chunk_size", row.chunk_size)?,
            total_chunks: decode_unsigned("total_chunks", row.total_chunks)?,
            uploaded_chunks: decode_unsigned("uploaded_chunks", row.uploaded_chunks)?,
            file_hash: row.file_hash,
            owner_id: row.owner_id,
            status: row.status.parse()?,
            final_path: row.final_path,
            created_at: decode_time(&row.created_at)?,
            updated_at: decode_time(&row.updated_at)?,
            expires_at: decode_time(&row.expires_at)?,
        })
    }
}

/// SQLite-backed session store
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run an update that must touch exactly one session
    async fn update_one<'q>(
        &self,
        id: Uuid,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<(), UploadError> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(UploadError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }
}

fn to_i64(column: &str, value: u64) -> Result<i64, UploadError> {
    i64::try_from(value)
        .map_err(|_| UploadError::Database(format!("column {} out of range: {}", column, value)))
}

#[async_trait::async_trait]
impl SessionStore for SqliteSessionStore {
    async fn insert(&self, session: &UploadSession) -> Result<(), UploadError> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, file_name, file_size, chunk_size, total_chunks,
                                         uploaded_chunks, file_hash, owner_id, status, final_path,
                                         created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.file_name)
        .bind(to_i64("file_size", session.total_size)?)
        .bind(to_i64("chunk_size", session.chunk_size)?)
        .bind(i64::from(session.total_chunks))
        .bind(i64::from(session.uploaded_chunks))
        .bind(&session.file_hash)
        .bind(&session.owner_id)
        .bind(session.status.as_str())
        .bind(&session.final_path)
        .bind(encode_time(session.created_at))
        .bind(encode_time(session.updated_at))
        .bind(encode_time(session.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, file_name, file_size, chunk_size, total_chunks, uploaded_chunks,
                   file_hash, owner_id, status, final_path, created_at, updated_at, expires_at
            FROM upload_sessions
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadSession::try_from).transpose()
    }

    async fn set_uploaded_chunks(
        &self,
        id: Uuid,
        uploaded_chunks: u32,
        at: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        let query = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET uploaded_chunks = MIN(?, total_chunks), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(uploaded_chunks))
        .bind(encode_time(at))
        .bind(id.to_string());

        self.update_one(id, query).await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        final_path: &str,
        at: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        let query = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = ?, final_path = ?, uploaded_chunks = total_chunks, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(SessionStatus::Completed.as_str())
        .bind(final_path)
        .bind(encode_time(at))
        .bind(id.to_string());

        self.update_one(id, query).await
    }

    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), UploadError> {
        let query = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(SessionStatus::Cancelled.as_str())
        .bind(encode_time(at))
        .bind(id.to_string());

        self.update_one(id, query).await
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        include_completed: bool,
    ) -> Result<Vec<Uuid>, UploadError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM upload_sessions
            WHERE expires_at <= ? AND (? OR status != ?)
            ORDER BY expires_at ASC
            "#,
        )
        .bind(encode_time(now))
        .bind(include_completed)
        .bind(SessionStatus::Completed.as_str())
        .fetch_all(&self.pool)
        .await?;

        ids.iter().map(|id| decode_uuid(id)).collect()
    }

    async fn delete_many(&self, ids: &[Uuid]) -> Result<usize, UploadError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for id in ids {
            let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::upload::ChunkLayout;
    use chrono::Duration;

    async fn store() -> SqliteSessionStore {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        SqliteSessionStore::new(pool)
    }

    fn session(created_at: DateTime<Utc>) -> UploadSession {
        UploadSession::new(
            "thesis.pdf".to_string(),
            5_000_000,
            ChunkLayout { chunk_size: 2_097_152, total_chunks: 3 },
            Some("5d41402abc4b2a76b9719d911017c592".to_string()),
            "42".to_string(),
            Duration::hours(24),
            created_at,
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let store = store().await;
        let session = session(Utc::now());
        store.insert(&session).await.unwrap();

        let loaded = store.get(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.total_size, 5_000_000);
        assert_eq!(loaded.total_chunks, 3);
        assert_eq!(loaded.file_hash, session.file_hash);
        assert_eq!(loaded.status, SessionStatus::InProgress);
        assert_eq!(loaded.expires_at.timestamp_micros(), session.expires_at.timestamp_micros());

        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.insert(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_status_updates() {
        let store = store().await;
        let session = session(Utc::now());
        store.insert(&session).await.unwrap();

        store.set_uploaded_chunks(session.id, 9, Utc::now()).await.unwrap();
        assert_eq!(store.get(session.id).await.unwrap().unwrap().uploaded_chunks, 3);

        store
            .mark_completed(session.id, "/tmp/uploads/thesis.pdf", Utc::now())
            .await
            .unwrap();
        let loaded = store.get(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.final_path.as_deref(), Some("/tmp/uploads/thesis.pdf"));

        let missing = store.mark_cancelled(Uuid::new_v4(), Utc::now()).await;
        assert!(matches!(missing, Err(UploadError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_and_delete_many() {
        let store = store().await;
        let now = Utc::now();
        let stale = session(now - Duration::hours(25));
        let completed = session(now - Duration::hours(25));
        let fresh = session(now - Duration::hours(1));
        for s in [&stale, &completed, &fresh] {
            store.insert(s).await.unwrap();
        }
        store.mark_completed(completed.id, "/tmp/x", now).await.unwrap();

        assert_eq!(store.expired(now, false).await.unwrap(), vec![stale.id]);
        let mut all = store.expired(now, true).await.unwrap();
        all.sort();
        let mut expected = vec![stale.id, completed.id];
        expected.sort();
        assert_eq!(all, expected);

        assert_eq!(store.delete_many(&[stale.id, Uuid::new_v4()]).await.unwrap(), 1);
        assert!(store.get(stale.id).await.unwrap().is_none());
        assert!(store.get(fresh.id).await.unwrap().is_some());
    }
}
