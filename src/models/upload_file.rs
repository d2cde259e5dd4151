//! Represents one logical file upload (a session) and its final stored file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of an upload session.
///
/// Stored as lowercase text in SQLite.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Completed,
    Failed,
}

/// An upload session, created at init (or directly completed by a simple upload).
///
/// The row is never deleted: once the file is merged it doubles as the stored
/// file's metadata record and is the target of content-hash deduplication.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Session identifier handed back to the client.
    pub id: Uuid,

    /// Original client-supplied filename.
    pub filename: String,

    /// Server-generated name of the final blob (`<uuid><.ext>`).
    pub stored_name: String,

    /// Final location of the merged blob; `None` until completed.
    pub file_path: Option<String>,

    /// Total size in bytes: declared at init, replaced by the merged size.
    pub file_size: i64,

    pub mime_type: String,

    /// Lowercase extension including the dot, e.g. `.png`.
    pub extension: String,

    /// Lowercase hex MD5 of the whole file, recomputed on merge.
    pub content_hash: String,

    pub status: UploadStatus,

    /// Chunk size the client declared at init.
    pub chunk_size: i64,

    pub chunk_total: i64,

    /// Number of chunk rows currently flagged uploaded.
    pub chunk_uploaded: i64,

    /// Identity of the uploading principal.
    pub owner_id: String,

    pub is_public: bool,

    /// Times the completed file has been served.
    pub download_count: i64,

    pub created_at: DateTime<Utc>,

    /// Last time the session made progress; abandoned sessions expire from here.
    pub updated_at: DateTime<Utc>,

    /// Set only when the session reaches `Completed`.
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn is_completed(&self) -> bool {
        self.status == UploadStatus::Completed
    }

    /// Path under which the completed file is served.
    pub fn access_path(&self) -> String {
        format!("/files/preview/{}", self.id)
    }
}
