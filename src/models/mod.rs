//! Core data models for the upload service.
//!
//! These map to the `upload_files` and `upload_chunks` tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod chunk;
pub mod upload_file;
