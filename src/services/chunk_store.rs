//! src/services/chunk_store.rs
//!
//! Blob persistence for chunk uploads. `ChunkStorage` is the seam the upload
//! service talks to; `LocalStorage` keeps blobs on local disk. Every write
//! goes to a `.tmp-*` sibling first and is renamed into place, so readers
//! never observe a half-written chunk or merged file.
//!
//! Merging never consumes its sources. The caller removes the chunk blobs
//! once the completed file has been recorded, so a merge that fails at any
//! step can be re-run from the same chunks.

use crate::services::hasher::ContentHasher;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// What a merge produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedBlob {
    pub size: u64,
    /// MD5 of the merged bytes, lowercase hex.
    pub content_hash: String,
}

/// Storage backend for chunk and file blobs.
#[async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Write `data` to `path`, replacing whatever was there.
    async fn save_chunk(&self, path: &Path, data: Bytes) -> io::Result<()>;

    /// Concatenate `ordered_paths` into `target`, digesting the bytes on the way.
    ///
    /// Sources are left in place. On failure the target does not exist.
    async fn merge_chunks(&self, ordered_paths: &[PathBuf], target: &Path)
    -> io::Result<MergedBlob>;

    /// Store a complete file under `stored_name` and return its path.
    async fn save_file(&self, stored_name: &str, data: Bytes) -> io::Result<PathBuf>;

    /// Remove a blob. Missing blobs are not an error.
    async fn delete_file(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory of blobs. Missing directories are not an error.
    async fn delete_dir(&self, path: &Path) -> io::Result<()>;

    async fn file_exists(&self, path: &Path) -> io::Result<bool>;

    async fn file_size(&self, path: &Path) -> io::Result<u64>;
}

/// Local-disk `ChunkStorage`.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    /// Directory that `save_file` writes into.
    base_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create a unique temporary sibling of `path`, making parents as needed.
    async fn temp_sibling(path: &Path) -> io::Result<(PathBuf, File)> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "blob path missing parent directory")
        })?;
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok((tmp_path, file))
    }

    /// Flush, fsync and rename `tmp_path` over `path`.
    async fn commit(mut file: File, tmp_path: &Path, path: &Path) -> io::Result<()> {
        let result = async {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            match fs::rename(tmp_path, path).await {
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    fs::remove_file(path).await?;
                    fs::rename(tmp_path, path).await
                }
                other => other,
            }
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(tmp_path).await;
        }
        result
    }

    /// Write `data` to `path` through a temp file.
    async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
        let (tmp_path, mut file) = Self::temp_sibling(path).await?;
        if let Err(err) = file.write_all(data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        Self::commit(file, &tmp_path, path).await
    }
}

#[async_trait]
impl ChunkStorage for LocalStorage {
    async fn save_chunk(&self, path: &Path, data: Bytes) -> io::Result<()> {
        Self::write_atomic(path, &data).await?;
        debug!("stored chunk {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    async fn merge_chunks(
        &self,
        ordered_paths: &[PathBuf],
        target: &Path,
    ) -> io::Result<MergedBlob> {
        let (tmp_path, mut out) = Self::temp_sibling(target).await?;

        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        for source in ordered_paths {
            let copied = async {
                let mut input = File::open(source).await?;
                loop {
                    let n = input.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n]).await?;
                }
                Ok::<_, io::Error>(())
            }
            .await;

            if let Err(err) = copied {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(io::Error::new(
                    err.kind(),
                    format!("reading chunk {}: {}", source.display(), err),
                ));
            }
        }

        Self::commit(out, &tmp_path, target).await?;

        let merged = MergedBlob {
            size: hasher.len(),
            content_hash: hasher.finish(),
        };
        debug!(
            "merged {} chunks into {} ({} bytes)",
            ordered_paths.len(),
            target.display(),
            merged.size
        );
        Ok(merged)
    }

    async fn save_file(&self, stored_name: &str, data: Bytes) -> io::Result<PathBuf> {
        let path = self.base_dir.join(stored_name);
        Self::write_atomic(&path, &data).await?;
        Ok(path)
    }

    async fn delete_file(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("removed blob {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete_dir(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn file_exists(&self, path: &Path) -> io::Result<bool> {
        fs::try_exists(path).await
    }

    async fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }
}
