//! HTTP handlers for simple and chunked uploads.
//! Each handler only adapts the request to an `UploadService` call.

use crate::{
    errors::AppError,
    services::upload_service::{
        ChunkUploadResult, FileMetadata, InitUpload, ProgressResult, SessionInitResult,
        SimpleUploadResult, UploadService,
    },
};
use axum::{
    Json,
    extract::{FromRequestParts, Multipart, Path, State},
    http::{HeaderMap, request::Parts},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the caller's identity, filled in by the auth layer in front.
pub const OWNER_HEADER: &str = "x-user-id";

/// Identity of the calling user.
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

/// Read the caller's identity from request headers, if present.
pub fn owner_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        owner_from_headers(&parts.headers)
            .map(OwnerId)
            .ok_or_else(|| AppError::unauthorized(format!("missing `{}` header", OWNER_HEADER)))
    }
}

/// Body of `POST /upload/chunk/init`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitChunkUploadReq {
    pub filename: String,
    pub file_size: u64,
    pub content_hash: String,
    pub chunk_size: Option<u64>,
}

/// Body of `POST /upload/chunk/merge`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeChunksReq {
    pub session_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfigResponse {
    pub max_file_size: u64,
    pub chunk_size: u64,
    /// Largest `chunkSize` accepted at init.
    pub max_chunk_size: u64,
    pub allowed_mime_types: Vec<String>,
}

/// `GET /upload/config` — limits a client needs before it starts uploading.
pub async fn get_upload_config(State(service): State<UploadService>) -> Json<UploadConfigResponse> {
    let cfg = service.config();
    Json(UploadConfigResponse {
        max_file_size: cfg.max_file_size,
        chunk_size: cfg.chunk_size,
        max_chunk_size: cfg.max_chunk_size(),
        allowed_mime_types: cfg.allowed_mime_types.iter().cloned().collect(),
    })
}

/// `POST /upload/simple` — multipart with a single `file` field.
pub async fn simple_upload(
    State(service): State<UploadService>,
    OwnerId(owner): OwnerId,
    mut multipart: Multipart,
) -> Result<Json<SimpleUploadResult>, AppError> {
    let mut upload: Option<(String, Bytes)> = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::bad_request("`file` field has no filename"))?;
        let data = field.bytes().await?;
        upload = Some((filename, data));
    }

    let (filename, data) = upload.ok_or_else(|| AppError::bad_request("missing `file` field"))?;
    let result = service.simple_upload(data, &filename, &owner).await?;
    Ok(Json(result))
}

/// `POST /upload/chunk/init`
pub async fn init_chunk_upload(
    State(service): State<UploadService>,
    OwnerId(owner): OwnerId,
    Json(req): Json<InitChunkUploadReq>,
) -> Result<Json<SessionInitResult>, AppError> {
    let result = service
        .init_upload(InitUpload {
            filename: &req.filename,
            file_size: req.file_size,
            content_hash: &req.content_hash,
            chunk_size: req.chunk_size,
            owner_id: &owner,
        })
        .await?;
    Ok(Json(result))
}

/// `POST /upload/chunk` — multipart with `sessionId`, `chunkIndex`,
/// optional `chunkHash` and the `chunk` bytes.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    OwnerId(_owner): OwnerId,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResult>, AppError> {
    let mut session_id: Option<Uuid> = None;
    let mut chunk_index: Option<i64> = None;
    let mut chunk_hash: Option<String> = None;
    let mut chunk: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "sessionId" => {
                let text = field.text().await?;
                let id = Uuid::parse_str(text.trim())
                    .map_err(|_| AppError::bad_request("`sessionId` is not a valid id"))?;
                session_id = Some(id);
            }
            "chunkIndex" => {
                let text = field.text().await?;
                let index = text
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| AppError::bad_request("`chunkIndex` must be a non-negative integer"))?;
                chunk_index = Some(i64::from(index));
            }
            "chunkHash" => chunk_hash = Some(field.text().await?),
            "chunk" => chunk = Some(field.bytes().await?),
            _ => {}
        }
    }

    let session_id = session_id.ok_or_else(|| AppError::bad_request("missing `sessionId` field"))?;
    let chunk_index =
        chunk_index.ok_or_else(|| AppError::bad_request("missing `chunkIndex` field"))?;
    let chunk = chunk.ok_or_else(|| AppError::bad_request("missing `chunk` field"))?;

    let result = service
        .upload_chunk(session_id, chunk_index, chunk_hash.as_deref(), chunk)
        .await?;
    Ok(Json(result))
}

/// `POST /upload/chunk/merge`
pub async fn merge_chunks(
    State(service): State<UploadService>,
    OwnerId(_owner): OwnerId,
    Json(req): Json<MergeChunksReq>,
) -> Result<Json<FileMetadata>, AppError> {
    let result = service.merge_chunks(req.session_id).await?;
    Ok(Json(result))
}

/// `GET /upload/progress/{session_id}`
pub async fn get_progress(
    State(service): State<UploadService>,
    OwnerId(_owner): OwnerId,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ProgressResult>, AppError> {
    let result = service.get_progress(session_id).await?;
    Ok(Json(result))
}
