//! Defines routes for the upload service.
//!
//! ## Structure
//! - **Upload endpoints** (require the `x-user-id` header)
//!   - `POST /upload/simple`                 — one-shot upload of a small file
//!   - `POST /upload/chunk/init`             — start a chunked upload session
//!   - `POST /upload/chunk`                  — upload one chunk
//!   - `POST /upload/chunk/merge`            — merge all chunks into the final file
//!   - `GET  /upload/progress/{session_id}`  — session progress
//!   - `GET  /upload/config`                 — client-facing limits (no auth)
//!
//! - **File endpoints**
//!   - `GET /files/preview/{id}[/{filename}]`  — stream inline
//!   - `GET /files/download/{id}[/{filename}]` — stream as attachment

use crate::{
    handlers::{
        file_handlers::{download_file, preview_file},
        health_handlers::{healthz, readyz},
        upload_handlers::{
            get_progress, get_upload_config, init_chunk_upload, merge_chunks, simple_upload,
            upload_chunk,
        },
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for all upload routes.
///
/// `max_request_bytes` caps request bodies on the upload endpoints.
pub fn routes(max_request_bytes: usize) -> Router<UploadService> {
    let uploads = Router::new()
        .route("/simple", post(simple_upload))
        .route("/chunk/init", post(init_chunk_upload))
        .route("/chunk", post(upload_chunk))
        .route("/chunk/merge", post(merge_chunks))
        .route("/progress/{session_id}", get(get_progress))
        .route("/config", get(get_upload_config))
        .layer(DefaultBodyLimit::max(max_request_bytes));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/upload", uploads)
        .route("/files/preview/{id}", get(preview_file))
        .route("/files/preview/{id}/{filename}", get(preview_file))
        .route("/files/download/{id}", get(download_file))
        .route("/files/download/{id}/{filename}", get(download_file))
}
