//! Persistence façade for upload sessions and their chunk rows.
//!
//! Pure data access over SQLite: no validation or lifecycle policy lives
//! here, that belongs to `UploadService`.

use crate::models::{
    chunk::ChunkRecord,
    upload_file::{UploadSession, UploadStatus},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, filename, stored_name, file_path, file_size, mime_type, \
     extension, content_hash, status, chunk_size, chunk_total, chunk_uploaded, owner_id, \
     is_public, download_count, created_at, updated_at, uploaded_at";

const CHUNK_COLUMNS: &str =
    "id, session_id, chunk_index, chunk_path, chunk_hash, chunk_size, is_uploaded";

#[derive(Clone)]
pub struct UploadRepository {
    db: Arc<SqlitePool>,
}

impl UploadRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a session row on its own (simple uploads).
    pub async fn create_session(&self, session: &UploadSession) -> sqlx::Result<()> {
        insert_session(&*self.db, session).await
    }

    /// Insert a session and all of its chunk rows in one transaction.
    pub async fn create_session_with_chunks(
        &self,
        session: &UploadSession,
        chunks: &[ChunkRecord],
    ) -> sqlx::Result<()> {
        let mut tx = self.db.begin().await?;
        insert_session(&mut *tx, session).await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO upload_chunks
                    (id, session_id, chunk_index, chunk_path, chunk_hash, chunk_size, is_uploaded)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.id)
            .bind(chunk.session_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.chunk_path)
            .bind(&chunk.chunk_hash)
            .bind(chunk.chunk_size)
            .bind(chunk.is_uploaded)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn get_session(&self, id: Uuid) -> sqlx::Result<Option<UploadSession>> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_files WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Dedup lookup: the oldest *completed* session with this content hash.
    pub async fn find_completed_by_hash(
        &self,
        content_hash: &str,
    ) -> sqlx::Result<Option<UploadSession>> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_files
             WHERE content_hash = ? AND status = ?
             ORDER BY uploaded_at ASC LIMIT 1"
        ))
        .bind(content_hash)
        .bind(UploadStatus::Completed)
        .fetch_optional(&*self.db)
        .await
    }

    /// Persist a recounted progress value and mark the session active at `at`.
    /// Never moves the counter backwards.
    pub async fn update_progress(
        &self,
        id: Uuid,
        chunk_uploaded: i64,
        at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE upload_files
             SET chunk_uploaded = MAX(chunk_uploaded, ?), updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(chunk_uploaded)
        .bind(at)
        .bind(id)
        .bind(UploadStatus::Uploading)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Flip a session to completed and record what landed where.
    pub async fn mark_completed(
        &self,
        id: Uuid,
        file_path: &str,
        file_size: i64,
        content_hash: &str,
        uploaded_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE upload_files
             SET status = ?, file_path = ?, file_size = ?, content_hash = ?, uploaded_at = ?,
                 updated_at = ?, chunk_uploaded = chunk_total
             WHERE id = ?",
        )
        .bind(UploadStatus::Completed)
        .bind(file_path)
        .bind(file_size)
        .bind(content_hash)
        .bind(uploaded_at)
        .bind(uploaded_at)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Uploading sessions with no progress since `cutoff`.
    pub async fn list_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> sqlx::Result<Vec<UploadSession>> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_files
             WHERE status = ? AND updated_at < ?
             ORDER BY updated_at ASC"
        ))
        .bind(UploadStatus::Uploading)
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await
    }

    /// Count one more serve of a stored file.
    pub async fn increment_download_count(&self, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE upload_files SET download_count = download_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Mark a still-uploading session as failed. Returns false if it moved on.
    pub async fn mark_failed(&self, id: Uuid) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE upload_files SET status = ? WHERE id = ? AND status = ?")
            .bind(UploadStatus::Failed)
            .bind(id)
            .bind(UploadStatus::Uploading)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_chunk(
        &self,
        session_id: Uuid,
        chunk_index: i64,
    ) -> sqlx::Result<Option<ChunkRecord>> {
        sqlx::query_as::<_, ChunkRecord>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM upload_chunks WHERE session_id = ? AND chunk_index = ?"
        ))
        .bind(session_id)
        .bind(chunk_index)
        .fetch_optional(&*self.db)
        .await
    }

    /// Flag a chunk as uploaded and record what was written.
    pub async fn mark_chunk_uploaded(
        &self,
        session_id: Uuid,
        chunk_index: i64,
        chunk_size: i64,
        chunk_hash: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE upload_chunks
             SET is_uploaded = 1, chunk_size = ?, chunk_hash = ?
             WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(chunk_size)
        .bind(chunk_hash)
        .bind(session_id)
        .bind(chunk_index)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn count_uploaded_chunks(&self, session_id: Uuid) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM upload_chunks WHERE session_id = ? AND is_uploaded = 1",
        )
        .bind(session_id)
        .fetch_one(&*self.db)
        .await
    }

    /// All chunk rows of a session, ascending by index.
    pub async fn list_chunks(&self, session_id: Uuid) -> sqlx::Result<Vec<ChunkRecord>> {
        sqlx::query_as::<_, ChunkRecord>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM upload_chunks
             WHERE session_id = ? ORDER BY chunk_index ASC"
        ))
        .bind(session_id)
        .fetch_all(&*self.db)
        .await
    }

    pub async fn delete_chunks(&self, session_id: Uuid) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_session<'e, E>(executor: E, session: &UploadSession) -> sqlx::Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(&format!(
        "INSERT INTO upload_files ({SESSION_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(session.id)
    .bind(&session.filename)
    .bind(&session.stored_name)
    .bind(&session.file_path)
    .bind(session.file_size)
    .bind(&session.mime_type)
    .bind(&session.extension)
    .bind(&session.content_hash)
    .bind(session.status)
    .bind(session.chunk_size)
    .bind(session.chunk_total)
    .bind(session.chunk_uploaded)
    .bind(&session.owner_id)
    .bind(session.is_public)
    .bind(session.download_count)
    .bind(session.created_at)
    .bind(session.updated_at)
    .bind(session.uploaded_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn repo() -> UploadRepository {
        let pool = db::memory_pool().await.unwrap();
        UploadRepository::new(Arc::new(pool))
    }

    fn session(hash: &str, status: UploadStatus, chunk_total: i64) -> UploadSession {
        let id = Uuid::new_v4();
        UploadSession {
            id,
            filename: "a.txt".into(),
            stored_name: format!("{id}.txt"),
            file_path: None,
            file_size: 10,
            mime_type: "text/plain".into(),
            extension: ".txt".into(),
            content_hash: hash.into(),
            status,
            chunk_size: 4,
            chunk_total,
            chunk_uploaded: 0,
            owner_id: "u1".into(),
            is_public: true,
            download_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            uploaded_at: None,
        }
    }

    fn chunks(session: &UploadSession) -> Vec<ChunkRecord> {
        (0..session.chunk_total)
            .map(|i| ChunkRecord {
                id: Uuid::new_v4(),
                session_id: session.id,
                chunk_index: i,
                chunk_path: format!("/tmp/{}/chunk_{i}", session.id),
                chunk_hash: None,
                chunk_size: None,
                is_uploaded: false,
            })
            .collect()
    }

    #[tokio::test]
    async fn dedup_lookup_only_sees_completed_sessions() {
        let repo = repo().await;
        let hash = "0123456789abcdef0123456789abcdef";

        let pending = session(hash, UploadStatus::Uploading, 3);
        repo.create_session_with_chunks(&pending, &chunks(&pending))
            .await
            .unwrap();
        assert!(repo.find_completed_by_hash(hash).await.unwrap().is_none());

        repo.mark_completed(pending.id, "/files/x.txt", 10, hash, Utc::now())
            .await
            .unwrap();
        let found = repo.find_completed_by_hash(hash).await.unwrap().unwrap();
        assert_eq!(found.id, pending.id);
        assert_eq!(found.status, UploadStatus::Completed);
        assert_eq!(found.chunk_uploaded, 3);
        assert!(found.uploaded_at.is_some());
    }

    #[tokio::test]
    async fn chunk_rows_are_listed_in_index_order_and_counted() {
        let repo = repo().await;
        let s = session("ffffffffffffffffffffffffffffffff", UploadStatus::Uploading, 3);
        let mut rows = chunks(&s);
        rows.reverse();
        repo.create_session_with_chunks(&s, &rows).await.unwrap();

        repo.mark_chunk_uploaded(s.id, 2, 2, None).await.unwrap();
        repo.mark_chunk_uploaded(s.id, 0, 4, Some("abc")).await.unwrap();

        let listed = repo.list_chunks(s.id).await.unwrap();
        let indexes: Vec<i64> = listed.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(listed[0].chunk_hash.as_deref(), Some("abc"));
        assert_eq!(repo.count_uploaded_chunks(s.id).await.unwrap(), 2);

        assert_eq!(repo.delete_chunks(s.id).await.unwrap(), 3);
        assert!(repo.list_chunks(s.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let repo = repo().await;
        let s = session("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee", UploadStatus::Uploading, 3);
        repo.create_session(&s).await.unwrap();

        repo.update_progress(s.id, 2, Utc::now()).await.unwrap();
        repo.update_progress(s.id, 1, Utc::now()).await.unwrap();

        let stored = repo.get_session(s.id).await.unwrap().unwrap();
        assert_eq!(stored.chunk_uploaded, 2);
    }

    #[tokio::test]
    async fn staleness_follows_last_progress_not_creation() {
        let repo = repo().await;
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let cutoff = Utc::now() - chrono::Duration::hours(1);

        let mut s = session("cccccccccccccccccccccccccccccccc", UploadStatus::Uploading, 3);
        s.created_at = long_ago;
        s.updated_at = long_ago;
        repo.create_session(&s).await.unwrap();

        let stale = repo.list_stale_sessions(cutoff).await.unwrap();
        assert_eq!(stale.iter().map(|x| x.id).collect::<Vec<_>>(), vec![s.id]);

        // An old session that is still receiving chunks is not abandoned.
        repo.update_progress(s.id, 1, Utc::now()).await.unwrap();
        assert!(repo.list_stale_sessions(cutoff).await.unwrap().is_empty());

        let stored = repo.get_session(s.id).await.unwrap().unwrap();
        assert!(stored.created_at < cutoff);
        assert!(stored.updated_at > cutoff);
    }

    #[tokio::test]
    async fn download_count_increments() {
        let repo = repo().await;
        let s = session("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", UploadStatus::Completed, 1);
        repo.create_session(&s).await.unwrap();

        repo.increment_download_count(s.id).await.unwrap();
        repo.increment_download_count(s.id).await.unwrap();

        assert_eq!(repo.get_session(s.id).await.unwrap().unwrap().download_count, 2);
    }

    #[tokio::test]
    async fn duplicate_chunk_index_is_rejected_atomically() {
        let repo = repo().await;
        let s = session("dddddddddddddddddddddddddddddddd", UploadStatus::Uploading, 2);
        let mut rows = chunks(&s);
        rows[1].chunk_index = 0;

        assert!(repo.create_session_with_chunks(&s, &rows).await.is_err());
        assert!(repo.get_session(s.id).await.unwrap().is_none());
    }
}
