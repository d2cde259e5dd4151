//! Chunked file upload service: resumable uploads with per-chunk integrity
//! checks, content-hash deduplication and index-ordered merging.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::upload_service::UploadService;

/// Router with every route mounted and `service` as shared state.
pub fn build_router(service: UploadService) -> Router {
    let max_request_bytes = service.config().max_request_bytes;
    routes::routes::routes(max_request_bytes).with_state(service)
}
