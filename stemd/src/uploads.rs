//! On-disk storage for uploaded audio files.
//!
//! Every upload is written under the uploads directory with a server-generated name, so two
//! uploads never collide even when they carry the same client file name or identical content.
//! Completed uploads are left in place; nothing here deletes them.

use std::path::{Path, PathBuf};

use axum::extract::multipart::Field;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{Error, Result};

/// Longest client-supplied extension carried over to the stored file name.
const MAX_EXTENSION_LEN: usize = 8;

/// A file persisted by [`UploadStore::persist`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub id: Uuid,
    /// Absolute path of the stored file
    pub path: PathBuf,
    /// Name the client sent, if any. Informational only.
    pub original_name: Option<String>,
    pub bytes: u64,
}

/// Writes uploads into a fixed directory.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    /// Maximum file size in bytes, 0 for unlimited
    max_file_size: u64,
}

impl UploadStore {
    /// Create the uploads directory if needed and resolve it to an absolute path.
    pub async fn open(dir: impl AsRef<Path>, max_file_size: u64) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let dir = fs::canonicalize(dir).await?;
        info!("Storing uploads in {}", dir.display());
        Ok(Self { dir, max_file_size })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generate a fresh path for an upload.
    ///
    /// The client's file name contributes at most its extension, and only when that extension
    /// is short and alphanumeric.
    pub fn new_path(&self, id: Uuid, original_name: Option<&str>) -> PathBuf {
        let name = id.simple().to_string();
        match original_name.and_then(safe_extension) {
            Some(ext) => self.dir.join(format!("{name}.{ext}")),
            None => self.dir.join(name),
        }
    }

    /// Stream a multipart field to a new file.
    ///
    /// Returns once the whole field is on disk. On failure the partial file is removed.
    pub async fn persist(&self, field: Field<'_>) -> Result<StoredUpload> {
        let id = Uuid::new_v4();
        let original_name = field.file_name().map(str::to_string);
        let path = self.new_path(id, original_name.as_deref());

        info!(upload_id = %id, filename = ?original_name, path = %path.display(), "Receiving upload");

        match self.write_field(field, &path).await {
            Ok(bytes) => {
                info!(upload_id = %id, bytes, "Upload stored");
                Ok(StoredUpload {
                    id,
                    path,
                    original_name,
                    bytes,
                })
            }
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&path).await {
                    warn!(upload_id = %id, "Failed to remove partial upload {}: {}", path.display(), remove_err);
                }
                Err(e)
            }
        }
    }

    async fn write_field(&self, mut field: Field<'_>, path: &Path) -> Result<u64> {
        let mut file = File::create(path).await?;
        let mut total_size = 0u64;
        let mut chunk_number = 0u64;

        while let Some(chunk) = field.chunk().await.map_err(|e| Error::BadRequest {
            message: format!("Failed to read file chunk: {}", e),
        })? {
            chunk_number += 1;
            total_size += chunk.len() as u64;

            debug!(chunk_number, chunk_size = chunk.len(), total_size, "Writing chunk");

            // Check size limit incrementally to fail fast
            if self.max_file_size > 0 && total_size > self.max_file_size {
                return Err(Error::PayloadTooLarge {
                    message: format!("File size exceeds maximum allowed size of {} bytes", self.max_file_size),
                });
            }

            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(total_size)
    }
}

fn safe_extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > MAX_EXTENSION_LEN || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_absolute_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = UploadStore::open(tmp.path().join("nested/uploads"), 0).await.unwrap();

        assert!(store.dir().is_absolute());
        assert!(store.dir().is_dir());
    }

    #[tokio::test]
    async fn test_new_path_keeps_safe_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let store = UploadStore::open(tmp.path(), 0).await.unwrap();
        let id = Uuid::new_v4();

        let path = store.new_path(id, Some("My Song.WAV"));

        assert_eq!(path, store.dir().join(format!("{}.wav", id.simple())));
    }

    #[tokio::test]
    async fn test_new_path_ignores_unsafe_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = UploadStore::open(tmp.path(), 0).await.unwrap();
        let id = Uuid::new_v4();
        let bare = store.dir().join(id.simple().to_string());

        assert_eq!(store.new_path(id, None), bare);
        assert_eq!(store.new_path(id, Some("noextension")), bare);
        assert_eq!(store.new_path(id, Some("../../etc/passwd")), bare);
        assert_eq!(store.new_path(id, Some("track.mp3; rm -rf /")), bare);
        assert_eq!(store.new_path(id, Some("archive.verylongext")), bare);
    }

    #[tokio::test]
    async fn test_new_paths_are_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let store = UploadStore::open(tmp.path(), 0).await.unwrap();

        let a = store.new_path(Uuid::new_v4(), Some("song.wav"));
        let b = store.new_path(Uuid::new_v4(), Some("song.wav"));

        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(store.dir()));
    }
}
