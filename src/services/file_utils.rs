//! Filename, MIME and chunk-layout helpers shared by the upload paths.

use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MAX_FILENAME_LEN: usize = 255;

const RESERVED_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Validate a client-supplied filename.
///
/// Returns a human readable reason on rejection.
pub fn validate_filename(filename: &str) -> Result<(), String> {
    if filename.trim().is_empty() {
        return Err("filename must not be empty".into());
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(format!(
            "filename too long, maximum length is {} bytes",
            MAX_FILENAME_LEN
        ));
    }
    if let Some(c) = filename.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(format!("filename contains reserved character `{}`", c));
    }
    if filename.chars().any(|c| c.is_control()) {
        return Err("filename contains control characters".into());
    }
    if filename == "." || filename == ".." {
        return Err("filename must not be a relative path component".into());
    }
    Ok(())
}

/// Lowercase extension including the leading dot, or empty.
pub fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Map a filename's extension to a MIME type.
pub fn mime_type_for(filename: &str) -> Option<&'static str> {
    let mime = match file_extension(filename).as_str() {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".mp4" => "video/mp4",
        ".avi" => "video/avi",
        ".mov" => "video/mov",
        ".pdf" => "application/pdf",
        ".txt" => "text/plain",
        ".zip" => "application/zip",
        ".rar" => "application/x-rar-compressed",
        ".bin" => "application/octet-stream",
        _ => return None,
    };
    Some(mime)
}

/// Collision-free name for the stored blob; keeps the original extension.
pub fn generate_stored_name(filename: &str) -> String {
    format!("{}{}", Uuid::new_v4(), file_extension(filename))
}

/// `ceil(file_size / chunk_size)`. `chunk_size` must be non-zero.
pub fn chunk_total(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(chunk_size)
}

/// Directory holding every chunk of one session.
pub fn session_chunk_dir(temp_dir: &Path, session_id: Uuid) -> PathBuf {
    temp_dir.join(session_id.to_string())
}

/// Deterministic location of one chunk's bytes.
pub fn chunk_path(temp_dir: &Path, session_id: Uuid, chunk_index: u64) -> PathBuf {
    session_chunk_dir(temp_dir, session_id).join(format!("chunk_{}", chunk_index))
}
