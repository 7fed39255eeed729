//! Filesystem blob store for archived raw messages.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::BlobError;
use crate::store::traits::BlobStore;

/// Stores each blob as one file named by a UUID v5 digest of its key, so
/// every name has the same short length whatever the key. The key itself
/// stays recoverable from the archived bytes (the message's own headers).
///
/// Writes go to a temp file first and are hard-linked into place, so a
/// blob is either absent or complete and is never overwritten.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        if key.is_empty() {
            return Err(BlobError::InvalidKey("empty key".into()));
        }
        Ok(self.root.join(format!("{}.eml", blob_name(key))))
    }
}

fn blob_name(key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }

        let tmp = self.root.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                debug!(key, bytes = bytes.len(), "Blob archived");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
