//! src/services/upload_service.rs
//!
//! UploadService — session lifecycle for simple and chunked uploads.
//! Metadata lives in SQLite (`UploadRepository`), bytes live behind a
//! `ChunkStorage`. The service itself keeps no per-session state between
//! calls; progress is always recounted from the chunk rows.
//!
//! Blob writes and record writes are not covered by one transaction. When a
//! record write fails after a blob was stored, the blob is deleted again; a
//! crash between the two steps can still leave an unreferenced blob behind.

use crate::{
    config::UploadConfig,
    models::{
        chunk::ChunkRecord,
        upload_file::{UploadSession, UploadStatus},
    },
    services::{
        chunk_store::ChunkStorage,
        file_utils, hasher,
        upload_repository::UploadRepository,
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on the number of chunks a single session may declare.
pub const MAX_CHUNK_COUNT: u64 = 100_000;

/// Stale sessions expired in parallel by one sweep.
const SWEEP_CONCURRENCY: usize = 4;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("chunk checksum mismatch: expected {expected}, computed {actual}")]
    Integrity { expected: String, actual: String },
    #[error("chunks not fully uploaded, progress: {uploaded}/{total}")]
    Incomplete { uploaded: i64, total: i64 },
    #[error("upload session `{0}` has expired")]
    Expired(Uuid),
    #[error(transparent)]
    Storage(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Answer to an init call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInitResult {
    pub session_id: Uuid,
    pub chunk_size: u64,
    pub chunk_total: u64,
    /// True when identical content was already stored and nothing needs uploading.
    pub instant_upload: bool,
    /// Metadata of the reused file on an instant upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMetadata>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResult {
    pub session_id: Uuid,
    pub chunk_index: i64,
    pub chunk_uploaded: i64,
    pub chunk_total: i64,
    pub is_completed: bool,
}

/// Public view of a completed file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: Uuid,
    pub filename: String,
    pub stored_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub extension: String,
    pub content_hash: String,
    /// Where the file can be fetched over HTTP.
    pub file_path: String,
    pub download_count: i64,
    pub uploaded_at: DateTime<Utc>,
}

impl From<&UploadSession> for FileMetadata {
    fn from(session: &UploadSession) -> Self {
        Self {
            file_id: session.id,
            filename: session.filename.clone(),
            stored_name: session.stored_name.clone(),
            file_size: session.file_size,
            mime_type: session.mime_type.clone(),
            extension: session.extension.clone(),
            content_hash: session.content_hash.clone(),
            file_path: session.access_path(),
            download_count: session.download_count,
            uploaded_at: session.uploaded_at.unwrap_or(session.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleUploadResult {
    #[serde(flatten)]
    pub file: FileMetadata,
    pub instant_upload: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResult {
    pub session_id: Uuid,
    pub filename: String,
    pub file_size: i64,
    pub chunk_total: i64,
    pub chunk_uploaded: i64,
    pub progress_percent: f64,
    pub status: UploadStatus,
}

/// Inputs of an init call.
#[derive(Debug, Clone)]
pub struct InitUpload<'a> {
    pub filename: &'a str,
    pub file_size: u64,
    pub content_hash: &'a str,
    /// Falls back to the configured default when `None`.
    pub chunk_size: Option<u64>,
    pub owner_id: &'a str,
}

/// Orchestrates upload sessions.
///
/// Cheap to clone; every clone shares the same pool, storage and config.
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite pool, also used by the readiness probe.
    pub db: Arc<SqlitePool>,
    repo: UploadRepository,
    storage: Arc<dyn ChunkStorage>,
    config: Arc<UploadConfig>,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, storage: Arc<dyn ChunkStorage>, config: UploadConfig) -> Self {
        Self {
            repo: UploadRepository::new(db.clone()),
            db,
            storage,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Filename, size and MIME checks shared by both upload paths.
    /// Returns `(mime_type, extension)` on success.
    fn validate_file(&self, filename: &str, file_size: u64) -> UploadResult<(String, String)> {
        file_utils::validate_filename(filename).map_err(UploadError::Validation)?;

        if !self.config.is_size_allowed(file_size) {
            return Err(UploadError::Validation(format!(
                "file size {} out of range, must be between 1 and {} bytes",
                file_size, self.config.max_file_size
            )));
        }

        let extension = file_utils::file_extension(filename);
        let mime_type = file_utils::mime_type_for(filename)
            .filter(|mime| self.config.is_mime_allowed(mime))
            .ok_or_else(|| {
                UploadError::Validation(format!(
                    "unsupported file type `{}`",
                    if extension.is_empty() { filename } else { &extension }
                ))
            })?;

        Ok((mime_type.to_string(), extension))
    }

    async fn fetch_session(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        self.repo
            .get_session(session_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("upload session `{}` not found", session_id)))
    }

    /// Start a chunked upload, or short-circuit when the content is already stored.
    pub async fn init_upload(&self, req: InitUpload<'_>) -> UploadResult<SessionInitResult> {
        let (mime_type, extension) = self.validate_file(req.filename, req.file_size)?;

        if !hasher::is_valid_hash(req.content_hash) {
            return Err(UploadError::Validation(format!(
                "content hash must be {} hex characters",
                hasher::HASH_HEX_LEN
            )));
        }
        let content_hash = req.content_hash.to_ascii_lowercase();

        let chunk_size = req.chunk_size.unwrap_or(self.config.chunk_size);
        if chunk_size == 0 {
            return Err(UploadError::Validation("chunk size must be positive".into()));
        }
        let max_chunk_size = self.config.max_chunk_size();
        if chunk_size > max_chunk_size {
            return Err(UploadError::Validation(format!(
                "chunk size {} exceeds the maximum of {} bytes",
                chunk_size, max_chunk_size
            )));
        }

        if let Some(existing) = self.repo.find_completed_by_hash(&content_hash).await? {
            info!(
                hash = %content_hash,
                file_id = %existing.id,
                "content already stored, instant upload"
            );
            return Ok(SessionInitResult {
                session_id: existing.id,
                chunk_size,
                chunk_total: existing.chunk_total as u64,
                instant_upload: true,
                file: Some(FileMetadata::from(&existing)),
            });
        }

        let chunk_total = file_utils::chunk_total(req.file_size, chunk_size);
        if chunk_total > MAX_CHUNK_COUNT {
            return Err(UploadError::Validation(format!(
                "{} chunks requested, at most {} allowed; use a larger chunk size",
                chunk_total, MAX_CHUNK_COUNT
            )));
        }

        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let session = UploadSession {
            id: session_id,
            filename: req.filename.to_string(),
            stored_name: file_utils::generate_stored_name(req.filename),
            file_path: None,
            file_size: req.file_size as i64,
            mime_type,
            extension,
            content_hash,
            status: UploadStatus::Uploading,
            chunk_size: chunk_size as i64,
            chunk_total: chunk_total as i64,
            chunk_uploaded: 0,
            owner_id: req.owner_id.to_string(),
            is_public: true,
            download_count: 0,
            created_at: now,
            updated_at: now,
            uploaded_at: None,
        };

        let chunks: Vec<ChunkRecord> = (0..chunk_total)
            .map(|index| ChunkRecord {
                id: Uuid::new_v4(),
                session_id,
                chunk_index: index as i64,
                chunk_path: file_utils::chunk_path(&self.config.temp_dir, session_id, index)
                    .to_string_lossy()
                    .into_owned(),
                chunk_hash: None,
                chunk_size: None,
                is_uploaded: false,
            })
            .collect();

        self.repo.create_session_with_chunks(&session, &chunks).await?;

        info!(session_id = %session_id, chunk_total, "chunked upload initialized");

        Ok(SessionInitResult {
            session_id,
            chunk_size,
            chunk_total,
            instant_upload: false,
            file: None,
        })
    }

    /// Accept one chunk. Re-sending an already stored chunk is a no-op.
    pub async fn upload_chunk(
        &self,
        session_id: Uuid,
        chunk_index: i64,
        chunk_hash: Option<&str>,
        data: Bytes,
    ) -> UploadResult<ChunkUploadResult> {
        let session = self.fetch_session(session_id).await?;
        let progress = |uploaded: i64| ChunkUploadResult {
            session_id,
            chunk_index,
            chunk_uploaded: uploaded,
            chunk_total: session.chunk_total,
            is_completed: uploaded == session.chunk_total,
        };

        match session.status {
            UploadStatus::Completed => return Ok(progress(session.chunk_total)),
            UploadStatus::Failed => return Err(UploadError::Expired(session_id)),
            UploadStatus::Uploading => {}
        }

        let chunk = self
            .repo
            .get_chunk(session_id, chunk_index)
            .await?
            .ok_or_else(|| {
                UploadError::NotFound(format!(
                    "chunk {} not found, session `{}` has {} chunks",
                    chunk_index, session_id, session.chunk_total
                ))
            })?;

        if chunk.is_uploaded {
            let uploaded = self.repo.count_uploaded_chunks(session_id).await?;
            return Ok(progress(uploaded));
        }

        if data.is_empty() {
            return Err(UploadError::Validation("chunk must not be empty".into()));
        }
        if data.len() as i64 > session.chunk_size {
            return Err(UploadError::Validation(format!(
                "chunk of {} bytes exceeds the session chunk size of {} bytes",
                data.len(),
                session.chunk_size
            )));
        }

        let expected = chunk_hash.map(str::trim).filter(|h| !h.is_empty());
        if let Some(expected) = expected {
            let actual = hasher::md5_hex(&data);
            if !hasher::hashes_match(expected, &actual) {
                return Err(UploadError::Integrity {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let chunk_size = data.len() as i64;
        self.storage
            .save_chunk(Path::new(&chunk.chunk_path), data)
            .await?;

        let stored_hash = expected.map(str::to_ascii_lowercase);
        self.repo
            .mark_chunk_uploaded(session_id, chunk_index, chunk_size, stored_hash.as_deref())
            .await?;

        let uploaded = self.repo.count_uploaded_chunks(session_id).await?;
        self.repo.update_progress(session_id, uploaded, Utc::now()).await?;

        info!(
            session_id = %session_id,
            chunk_index,
            "chunk stored, progress {}/{}",
            uploaded,
            session.chunk_total
        );

        Ok(progress(uploaded))
    }

    /// Concatenate every chunk, in index order, into the final file.
    pub async fn merge_chunks(&self, session_id: Uuid) -> UploadResult<FileMetadata> {
        let session = self.fetch_session(session_id).await?;
        match session.status {
            UploadStatus::Completed => return Ok(FileMetadata::from(&session)),
            UploadStatus::Failed => return Err(UploadError::Expired(session_id)),
            UploadStatus::Uploading => {}
        }

        let uploaded = self.repo.count_uploaded_chunks(session_id).await?;
        if uploaded != session.chunk_total {
            return Err(UploadError::Incomplete {
                uploaded,
                total: session.chunk_total,
            });
        }

        let chunks = self.repo.list_chunks(session_id).await?;
        let dense = chunks.len() as i64 == session.chunk_total
            && chunks
                .iter()
                .enumerate()
                .all(|(i, c)| c.chunk_index == i as i64 && c.is_uploaded);
        if !dense {
            return Err(UploadError::Incomplete {
                uploaded,
                total: session.chunk_total,
            });
        }

        let chunk_paths: Vec<PathBuf> = chunks.iter().map(|c| PathBuf::from(&c.chunk_path)).collect();
        let target = self.config.upload_dir.join(&session.stored_name);
        let merged = self.storage.merge_chunks(&chunk_paths, &target).await?;

        if merged.size as i64 != session.file_size {
            warn!(
                session_id = %session_id,
                declared = session.file_size,
                merged = merged.size,
                "merged size differs from declared size"
            );
        }
        // Dedup keys on what was actually stored, not on what was declared.
        if merged.content_hash != session.content_hash {
            warn!(
                session_id = %session_id,
                declared = %session.content_hash,
                merged = %merged.content_hash,
                "merged content hash differs from declared hash"
            );
        }

        let target_str = target.to_string_lossy().into_owned();
        if let Err(err) = self
            .repo
            .mark_completed(
                session_id,
                &target_str,
                merged.size as i64,
                &merged.content_hash,
                Utc::now(),
            )
            .await
        {
            if let Err(cleanup) = self.storage.delete_file(&target).await {
                warn!("failed to remove merged file {}: {}", target.display(), cleanup);
            }
            return Err(err.into());
        }

        // The file is available from here on; cleanup failures are only logged.
        if let Err(err) = self.repo.delete_chunks(session_id).await {
            warn!(session_id = %session_id, "failed to delete chunk records: {}", err);
        }
        let chunk_dir = file_utils::session_chunk_dir(&self.config.temp_dir, session_id);
        if let Err(err) = self.storage.delete_dir(&chunk_dir).await {
            warn!(session_id = %session_id, "failed to delete chunk blobs: {}", err);
        }

        let completed = self.fetch_session(session_id).await?;
        info!(session_id = %session_id, filename = %completed.filename, "chunks merged");

        Ok(FileMetadata::from(&completed))
    }

    /// Read-only progress snapshot.
    pub async fn get_progress(&self, session_id: Uuid) -> UploadResult<ProgressResult> {
        let session = self.fetch_session(session_id).await?;
        let progress_percent = if session.chunk_total > 0 {
            session.chunk_uploaded as f64 / session.chunk_total as f64 * 100.0
        } else {
            0.0
        };

        Ok(ProgressResult {
            session_id,
            filename: session.filename,
            file_size: session.file_size,
            chunk_total: session.chunk_total,
            chunk_uploaded: session.chunk_uploaded,
            progress_percent,
            status: session.status,
        })
    }

    /// Store a small file in one shot.
    pub async fn simple_upload(
        &self,
        data: Bytes,
        filename: &str,
        owner_id: &str,
    ) -> UploadResult<SimpleUploadResult> {
        let (mime_type, extension) = self.validate_file(filename, data.len() as u64)?;

        let content_hash = hasher::md5_hex(&data);
        if let Some(existing) = self.repo.find_completed_by_hash(&content_hash).await? {
            info!(
                hash = %content_hash,
                file_id = %existing.id,
                "content already stored, instant upload"
            );
            return Ok(SimpleUploadResult {
                file: FileMetadata::from(&existing),
                instant_upload: true,
            });
        }

        let stored_name = file_utils::generate_stored_name(filename);
        let file_size = data.len() as i64;
        let file_path = self.storage.save_file(&stored_name, data).await?;

        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            stored_name,
            file_path: Some(file_path.to_string_lossy().into_owned()),
            file_size,
            mime_type,
            extension,
            content_hash,
            status: UploadStatus::Completed,
            chunk_size: file_size,
            chunk_total: 1,
            chunk_uploaded: 1,
            owner_id: owner_id.to_string(),
            is_public: true,
            download_count: 0,
            created_at: now,
            updated_at: now,
            uploaded_at: Some(now),
        };

        if let Err(err) = self.repo.create_session(&session).await {
            if let Err(cleanup) = self.storage.delete_file(&file_path).await {
                warn!("failed to remove orphaned file {}: {}", file_path.display(), cleanup);
            }
            return Err(err.into());
        }

        info!(file_id = %session.id, filename = %session.filename, "file uploaded");

        Ok(SimpleUploadResult {
            file: FileMetadata::from(&session),
            instant_upload: false,
        })
    }

    /// Fetch a completed file's record for download.
    pub async fn get_completed_file(&self, file_id: Uuid) -> UploadResult<UploadSession> {
        let session = self.fetch_session(file_id).await?;
        if !session.is_completed() || session.file_path.is_none() {
            return Err(UploadError::NotFound(format!("file `{}` not found", file_id)));
        }
        Ok(session)
    }

    /// Count a serve of a completed file. Failures are only logged.
    pub async fn record_download(&self, file_id: Uuid) {
        if let Err(err) = self.repo.increment_download_count(file_id).await {
            warn!(file_id = %file_id, "failed to record download: {}", err);
        }
    }

    /// Fail every uploading session idle for longer than `ttl` and drop its chunks.
    ///
    /// Returns the number of sessions expired by this call.
    pub async fn expire_stale_sessions(&self, ttl: Duration) -> UploadResult<usize> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| UploadError::Validation(format!("invalid ttl: {}", err)))?;
        let cutoff = Utc::now() - ttl;
        let stale = self.repo.list_stale_sessions(cutoff).await?;

        let expired = stream::iter(stale)
            .map(|session| async move {
                match self.expire_session(session.id).await {
                    Ok(done) => done,
                    Err(err) => {
                        warn!(session_id = %session.id, "failed to expire session: {}", err);
                        false
                    }
                }
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .filter(|done| futures::future::ready(*done))
            .count()
            .await;

        if expired > 0 {
            info!(expired, "expired abandoned upload sessions");
        }
        Ok(expired)
    }

    async fn expire_session(&self, session_id: Uuid) -> UploadResult<bool> {
        if !self.repo.mark_failed(session_id).await? {
            return Ok(false);
        }
        let chunk_dir = file_utils::session_chunk_dir(&self.config.temp_dir, session_id);
        self.storage.delete_dir(&chunk_dir).await?;
        self.repo.delete_chunks(session_id).await?;
        Ok(true)
    }

    /// Periodically expire abandoned sessions in the background.
    pub fn spawn_session_sweeper(&self, ttl: Duration) -> JoinHandle<()> {
        let service = self.clone();
        let period = (ttl / 4).max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = service.expire_stale_sessions(ttl).await {
                    warn!("session sweep failed: {}", err);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::chunk_store::LocalStorage};
    use tempfile::{TempDir, tempdir};

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    async fn service() -> (UploadService, TempDir) {
        let dir = tempdir().unwrap();
        let mut config = UploadConfig {
            upload_dir: dir.path().join("files"),
            temp_dir: dir.path().join("tmp"),
            ..UploadConfig::default()
        };
        config
            .allowed_mime_types
            .insert("application/octet-stream".into());
        let pool = db::memory_pool().await.unwrap();
        let storage = Arc::new(LocalStorage::new(&config.upload_dir));
        (UploadService::new(Arc::new(pool), storage, config), dir)
    }

    fn init<'a>(filename: &'a str, size: u64, hash: &'a str, chunk: u64) -> InitUpload<'a> {
        InitUpload {
            filename,
            file_size: size,
            content_hash: hash,
            chunk_size: Some(chunk),
            owner_id: "owner-1",
        }
    }

    #[tokio::test]
    async fn end_to_end_chunked_upload() {
        let (svc, _dir) = service().await;
        let hash = hasher::md5_hex(b"AAAABBBBCC");

        let started = svc.init_upload(init("a.bin", 10, &hash, 4)).await.unwrap();
        assert_eq!(started.chunk_total, 3);
        assert!(!started.instant_upload);
        let id = started.session_id;

        let r = svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();
        assert_eq!((r.chunk_uploaded, r.chunk_total, r.is_completed), (1, 3, false));
        let r = svc.upload_chunk(id, 1, None, Bytes::from_static(b"BBBB")).await.unwrap();
        assert_eq!((r.chunk_uploaded, r.is_completed), (2, false));
        let r = svc.upload_chunk(id, 2, None, Bytes::from_static(b"CC")).await.unwrap();
        assert_eq!((r.chunk_uploaded, r.is_completed), (3, true));

        // Completing every chunk does not merge by itself.
        let progress = svc.get_progress(id).await.unwrap();
        assert_eq!(progress.status, UploadStatus::Uploading);
        assert_eq!(progress.progress_percent, 100.0);

        let merged = svc.merge_chunks(id).await.unwrap();
        assert_eq!(merged.file_size, 10);
        assert_eq!(merged.content_hash, hash);
        assert_eq!(merged.filename, "a.bin");
        assert_eq!(merged.mime_type, "application/octet-stream");
        assert_eq!(merged.file_path, format!("/files/preview/{id}"));

        let on_disk = svc.config().upload_dir.join(&merged.stored_name);
        assert_eq!(tokio::fs::read(on_disk).await.unwrap(), b"AAAABBBBCC");

        let progress = svc.get_progress(id).await.unwrap();
        assert_eq!(progress.status, UploadStatus::Completed);
        assert!(svc.repo.list_chunks(id).await.unwrap().is_empty());
        assert!(!file_utils::session_chunk_dir(&svc.config().temp_dir, id).exists());
    }

    #[tokio::test]
    async fn merge_follows_index_order_not_arrival_order() {
        let (svc, _dir) = service().await;
        let id = svc
            .init_upload(init("a.bin", 10, EMPTY_MD5, 4))
            .await
            .unwrap()
            .session_id;

        svc.upload_chunk(id, 1, None, Bytes::from_static(b"BBBB")).await.unwrap();
        svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();
        svc.upload_chunk(id, 2, None, Bytes::from_static(b"CC")).await.unwrap();

        let merged = svc.merge_chunks(id).await.unwrap();
        let on_disk = svc.config().upload_dir.join(&merged.stored_name);
        assert_eq!(tokio::fs::read(on_disk).await.unwrap(), b"AAAABBBBCC");

        // The recorded hash is the digest of what was merged, not the declared one.
        assert_eq!(merged.content_hash, hasher::md5_hex(b"AAAABBBBCC"));
        let other = svc.init_upload(init("b.bin", 10, EMPTY_MD5, 4)).await.unwrap();
        assert!(!other.instant_upload);
    }

    #[tokio::test]
    async fn repeated_chunk_is_not_counted_twice() {
        let (svc, _dir) = service().await;
        let id = svc
            .init_upload(init("a.bin", 10, EMPTY_MD5, 4))
            .await
            .unwrap()
            .session_id;

        let first = svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();
        let second = svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();
        assert_eq!(first.chunk_uploaded, 1);
        assert_eq!(second.chunk_uploaded, 1);
        assert_eq!(svc.get_progress(id).await.unwrap().chunk_uploaded, 1);
    }

    #[tokio::test]
    async fn checksum_mismatch_rejects_chunk() {
        let (svc, _dir) = service().await;
        let id = svc
            .init_upload(init("a.bin", 10, EMPTY_MD5, 4))
            .await
            .unwrap()
            .session_id;

        let err = svc
            .upload_chunk(id, 0, Some(EMPTY_MD5), Bytes::from_static(b"AAAA"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Integrity { .. }));

        let chunk = svc.repo.get_chunk(id, 0).await.unwrap().unwrap();
        assert!(!chunk.is_uploaded);
        assert!(!Path::new(&chunk.chunk_path).exists());
        assert_eq!(svc.get_progress(id).await.unwrap().chunk_uploaded, 0);

        let good = hasher::md5_hex(b"AAAA").to_uppercase();
        let ok = svc
            .upload_chunk(id, 0, Some(&good), Bytes::from_static(b"AAAA"))
            .await
            .unwrap();
        assert_eq!(ok.chunk_uploaded, 1);
    }

    #[tokio::test]
    async fn merge_refused_until_complete() {
        let (svc, _dir) = service().await;
        let id = svc
            .init_upload(init("a.bin", 10, EMPTY_MD5, 4))
            .await
            .unwrap()
            .session_id;
        svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();

        let err = svc.merge_chunks(id).await.unwrap_err();
        assert!(matches!(err, UploadError::Incomplete { uploaded: 1, total: 3 }));
        assert_eq!(err.to_string(), "chunks not fully uploaded, progress: 1/3");

        let stored_name = svc.repo.get_session(id).await.unwrap().unwrap().stored_name;
        assert!(!svc.config().upload_dir.join(stored_name).exists());
    }

    #[tokio::test]
    async fn unknown_session_and_chunk_are_not_found() {
        let (svc, _dir) = service().await;
        let missing = Uuid::new_v4();
        assert!(matches!(svc.get_progress(missing).await, Err(UploadError::NotFound(_))));
        assert!(matches!(svc.merge_chunks(missing).await, Err(UploadError::NotFound(_))));
        assert!(matches!(
            svc.upload_chunk(missing, 0, None, Bytes::from_static(b"x")).await,
            Err(UploadError::NotFound(_))
        ));

        let id = svc
            .init_upload(init("a.bin", 10, EMPTY_MD5, 4))
            .await
            .unwrap()
            .session_id;
        assert!(matches!(
            svc.upload_chunk(id, 3, None, Bytes::from_static(b"x")).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            svc.upload_chunk(id, -1, None, Bytes::from_static(b"x")).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn init_validation() {
        let (svc, _dir) = service().await;
        let cases = [
            init("", 10, EMPTY_MD5, 4),
            init("../x.bin", 10, EMPTY_MD5, 4),
            init("a.bin", 0, EMPTY_MD5, 4),
            init("a.exe", 10, EMPTY_MD5, 4),
            init("a.bin", 10, "not-a-hash", 4),
            init("a.bin", 10, EMPTY_MD5, 0),
            init("a.bin", svc.config().max_file_size + 1, EMPTY_MD5, 4),
        ];
        for case in cases {
            let err = svc.init_upload(case.clone()).await.unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)), "{case:?} gave {err:?}");
        }
        let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_files")
            .fetch_one(&*svc.db)
            .await
            .unwrap();
        assert_eq!(sessions, 0);
    }

    #[tokio::test]
    async fn completed_content_is_deduplicated() {
        let (svc, _dir) = service().await;
        let data = Bytes::from_static(b"hello world");
        let first = svc.simple_upload(data.clone(), "hello.txt", "u1").await.unwrap();
        assert!(!first.instant_upload);

        let again = svc
            .init_upload(init("copy.txt", 11, &first.file.content_hash, 4))
            .await
            .unwrap();
        assert!(again.instant_upload);
        assert_eq!(again.session_id, first.file.file_id);
        let reused = again.file.unwrap();
        assert_eq!(reused.stored_name, first.file.stored_name);
        assert_eq!(reused.file_path, first.file.file_path);

        let chunk_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks")
            .fetch_one(&*svc.db)
            .await
            .unwrap();
        assert_eq!(chunk_rows, 0);

        let second = svc.simple_upload(data, "other.txt", "u2").await.unwrap();
        assert!(second.instant_upload);
        assert_eq!(second.file.stored_name, first.file.stored_name);

        let files = std::fs::read_dir(&svc.config().upload_dir).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn merged_upload_feeds_dedup() {
        let (svc, _dir) = service().await;
        let hash = hasher::md5_hex(b"AAAABB");
        let id = svc.init_upload(init("a.bin", 6, &hash, 4)).await.unwrap().session_id;
        svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();
        svc.upload_chunk(id, 1, None, Bytes::from_static(b"BB")).await.unwrap();
        let merged = svc.merge_chunks(id).await.unwrap();

        let again = svc.init_upload(init("b.bin", 6, &hash, 4)).await.unwrap();
        assert!(again.instant_upload);
        assert_eq!(again.file.unwrap().stored_name, merged.stored_name);

        // Merging a completed session just reports it again.
        let repeat = svc.merge_chunks(id).await.unwrap();
        assert_eq!(repeat.stored_name, merged.stored_name);
        let late = svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();
        assert!(late.is_completed);
    }

    #[tokio::test]
    async fn failed_completion_keeps_chunks_for_retry() {
        let (svc, _dir) = service().await;
        let id = svc
            .init_upload(init("a.bin", 10, EMPTY_MD5, 4))
            .await
            .unwrap()
            .session_id;
        svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();
        svc.upload_chunk(id, 1, None, Bytes::from_static(b"BBBB")).await.unwrap();
        svc.upload_chunk(id, 2, None, Bytes::from_static(b"CC")).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER reject_completion BEFORE UPDATE OF status ON upload_files
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&*svc.db)
        .await
        .unwrap();

        let err = svc.merge_chunks(id).await.unwrap_err();
        assert!(matches!(err, UploadError::Database(_)), "{err:?}");

        let session = svc.repo.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.status, UploadStatus::Uploading);
        assert!(!svc.config().upload_dir.join(&session.stored_name).exists());
        let chunks = svc.repo.list_chunks(id).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| Path::new(&c.chunk_path).exists()));

        sqlx::query("DROP TRIGGER reject_completion")
            .execute(&*svc.db)
            .await
            .unwrap();

        let merged = svc.merge_chunks(id).await.unwrap();
        let on_disk = svc.config().upload_dir.join(&merged.stored_name);
        assert_eq!(tokio::fs::read(on_disk).await.unwrap(), b"AAAABBBBCC");
        assert!(svc.repo.list_chunks(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_size_leaves_room_for_multipart_framing() {
        let (svc, _dir) = service().await;
        let max = svc.config().max_chunk_size();
        let limit = svc.config().max_request_bytes as u64;

        assert!(svc.init_upload(init("a.bin", max, EMPTY_MD5, max)).await.is_ok());
        for chunk in [max + 1, limit] {
            let err = svc
                .init_upload(init("a.bin", 10, EMPTY_MD5, chunk))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)), "{chunk}: {err:?}");
        }
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected() {
        let (svc, _dir) = service().await;
        let id = svc
            .init_upload(init("a.bin", 10, EMPTY_MD5, 4))
            .await
            .unwrap()
            .session_id;
        let err = svc
            .upload_chunk(id, 0, None, Bytes::from_static(b"AAAAA"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn simple_upload_removes_blob_when_record_write_fails() {
        let (svc, _dir) = service().await;
        sqlx::query(
            "CREATE TRIGGER reject_files BEFORE INSERT ON upload_files
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&*svc.db)
        .await
        .unwrap();

        let err = svc
            .simple_upload(Bytes::from_static(b"payload"), "p.txt", "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Database(_)));

        let upload_dir = &svc.config().upload_dir;
        let leftovers = std::fs::read_dir(upload_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn stale_sessions_are_expired() {
        let (svc, _dir) = service().await;
        let id = svc
            .init_upload(init("a.bin", 10, EMPTY_MD5, 4))
            .await
            .unwrap()
            .session_id;
        svc.upload_chunk(id, 0, None, Bytes::from_static(b"AAAA")).await.unwrap();

        // Nothing is old enough yet.
        assert_eq!(svc.expire_stale_sessions(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(svc.expire_stale_sessions(Duration::from_millis(1)).await.unwrap(), 1);

        let progress = svc.get_progress(id).await.unwrap();
        assert_eq!(progress.status, UploadStatus::Failed);
        assert!(svc.repo.list_chunks(id).await.unwrap().is_empty());
        assert!(!file_utils::session_chunk_dir(&svc.config().temp_dir, id).exists());
        assert!(matches!(
            svc.upload_chunk(id, 1, None, Bytes::from_static(b"BBBB")).await,
            Err(UploadError::Expired(_))
        ));
        assert!(matches!(svc.merge_chunks(id).await, Err(UploadError::Expired(_))));
    }
}
