//! Blob storage for message attachments.
//!
//! Image content parts never carry bytes inline; they reference blobs by
//! storage key. Keys are scoped per session so deleting a session can drop
//! its blobs wholesale.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::repositories::error::{RepositoryError, RepositoryResult};

/// Decode a `data:<mime>;base64,<payload>` URL into raw bytes.
pub fn decode_data_url(data_url: &str) -> RepositoryResult<Vec<u8>> {
    let payload = data_url
        .split_once("base64,")
        .map(|(_, rest)| rest)
        .ok_or_else(|| RepositoryError::InvalidData {
            message: "Not a base64 data URL".to_string(),
        })?;

    STANDARD
        .decode(payload)
        .map_err(|e| RepositoryError::InvalidData {
            message: format!("Invalid base64 payload: {e}"),
        })
}

/// Key/value storage for binary attachments.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn get_blob(&self, key: &str) -> RepositoryResult<Option<Vec<u8>>>;

    async fn set_blob(&self, key: &str, data: Vec<u8>) -> RepositoryResult<()>;

    /// Decode a data URL and store it under a fresh key within `scope`.
    /// Returns the storage key.
    async fn save_image(&self, scope: &str, data_url: &str) -> RepositoryResult<String> {
        let bytes = decode_data_url(data_url)?;
        let key = format!("{scope}/{}", Uuid::new_v4());
        self.set_blob(&key, bytes).await?;
        Ok(key)
    }
}

/// In-memory blob storage for tests and development.
#[derive(Clone, Default)]
pub struct InMemoryBlobStorage {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn get_blob(&self, key: &str) -> RepositoryResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    async fn set_blob(&self, key: &str, data: Vec<u8>) -> RepositoryResult<()> {
        self.blobs.lock().insert(key.to_string(), data);
        Ok(())
    }
}

/// Filesystem blob storage under the platform data directory,
/// e.g. `~/.local/share/tangent/blobs/<scope>/<uuid>`.
#[derive(Clone)]
pub struct FsBlobStorage {
    blobs_dir: PathBuf,
}

impl FsBlobStorage {
    pub fn new() -> RepositoryResult<Self> {
        let blobs_dir = dirs::data_dir()
            .ok_or_else(|| RepositoryError::Initialization {
                message: "Could not determine data directory".to_string(),
            })?
            .join("tangent")
            .join("blobs");

        Ok(Self { blobs_dir })
    }

    /// Use an explicit directory instead of the platform default.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            blobs_dir: dir.into(),
        }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.blobs_dir.join(key)
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn get_blob(&self, key: &str) -> RepositoryResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.blob_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_blob(&self, key: &str, data: Vec<u8>) -> RepositoryResult<()> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }
}
