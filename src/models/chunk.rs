//! Per-chunk bookkeeping for an in-progress upload session.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One row per `(session_id, chunk_index)`.
///
/// Rows are created up front when a session is initialized and removed once
/// the session's chunks have been merged.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkRecord {
    pub id: Uuid,

    /// Parent upload session.
    pub session_id: Uuid,

    /// Zero-based position of the chunk in the file.
    pub chunk_index: i64,

    /// Temporary location of the chunk bytes.
    pub chunk_path: String,

    /// Client-supplied MD5 of the chunk, if any.
    pub chunk_hash: Option<String>,

    /// Bytes actually written; `None` until uploaded.
    pub chunk_size: Option<i64>,

    pub is_uploaded: bool,
}
