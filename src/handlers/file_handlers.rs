//! Serving completed uploads back to clients.

use crate::{
    errors::AppError, handlers::upload_handlers::owner_from_headers,
    services::upload_service::UploadService,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use std::io;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Path of a file route. The optional trailing filename only makes URLs
/// readable; lookups go by id.
#[derive(Debug, Deserialize)]
pub struct FilePath {
    pub id: Uuid,
    pub filename: Option<String>,
}

/// `GET /files/preview/{id}[/{filename}]` — stream inline.
pub async fn preview_file(
    State(service): State<UploadService>,
    Path(path): Path<FilePath>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve_file(&service, path.id, &headers, "inline").await
}

/// `GET /files/download/{id}[/{filename}]` — stream as an attachment.
pub async fn download_file(
    State(service): State<UploadService>,
    Path(path): Path<FilePath>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve_file(&service, path.id, &headers, "attachment").await
}

async fn serve_file(
    service: &UploadService,
    file_id: Uuid,
    headers: &HeaderMap,
    disposition: &str,
) -> Result<Response, AppError> {
    let record = service.get_completed_file(file_id).await?;

    // Private files are only visible to their owner.
    if !record.is_public && owner_from_headers(headers).as_deref() != Some(record.owner_id.as_str()) {
        return Err(AppError::not_found(format!("file `{}` not found", file_id)));
    }

    let path = record.file_path.as_deref().unwrap_or_default();
    let file = File::open(path).await.map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            AppError::not_found(format!("file `{}` not found", file_id))
        } else {
            AppError::internal(err.to_string())
        }
    })?;
    let length = file
        .metadata()
        .await
        .map_err(|err| AppError::internal(format!("reading file metadata: {}", err)))?
        .len();

    service.record_download(file_id).await;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let resp_headers = response.headers_mut();
    resp_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    resp_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("{}; filename=\"{}\"", disposition, record.filename))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    resp_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&format!("\"{}\"", record.content_hash))
            .unwrap_or_else(|_| HeaderValue::from_static("\"\"")),
    );

    Ok(response)
}
