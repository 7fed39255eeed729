//! Archival writer: write-once copies of raw messages for reprocessing.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::BlobError;
use crate::store::BlobStore;

pub struct ArchivalWriter {
    store: Arc<dyn BlobStore>,
    timeout: Duration,
}

impl ArchivalWriter {
    pub fn new(store: Arc<dyn BlobStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Store `raw` under `message_id`. A no-op when already archived.
    /// Returns `true` when this call wrote the blob.
    pub async fn archive(&self, message_id: &str, raw: &[u8]) -> Result<bool, BlobError> {
        let written = self.bounded(self.store.put_if_absent(message_id, raw)).await?;
        if written {
            debug!(id = message_id, bytes = raw.len(), "Raw message archived");
        }
        Ok(written)
    }

    /// Read an archived copy back. Used by reprocessing only.
    pub async fn load(&self, message_id: &str) -> Result<Option<Vec<u8>>, BlobError> {
        self.bounded(self.store.get(message_id)).await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, BlobError>>,
    ) -> Result<T, BlobError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| BlobError::Timeout(self.timeout))?
    }
}
