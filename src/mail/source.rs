//! Mail sources: where raw messages come from.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::mail::RawMessage;

/// A source of raw messages.
///
/// Delivery is at-least-once: the same message may be returned by several
/// calls. Dedup happens in the pipeline through the audit ledger.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Short name used in logs and run summaries.
    fn name(&self) -> &str;

    /// Fetch messages that may not have been processed yet.
    async fn fetch_new(&self) -> Result<Vec<RawMessage>, PipelineError>;
}

/// Reads `*.eml` files from a spool directory, oldest file name first.
///
/// Files are left in place.
#[derive(Debug, Clone)]
pub struct SpoolDirSource {
    dir: PathBuf,
}

impl SpoolDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn source_err(&self, reason: String) -> PipelineError {
        PipelineError::Source {
            name: self.name().to_string(),
            reason,
        }
    }
}

#[async_trait]
impl MailSource for SpoolDirSource {
    fn name(&self) -> &str {
        "spool"
    }

    async fn fetch_new(&self) -> Result<Vec<RawMessage>, PipelineError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| self.source_err(format!("read_dir {}: {e}", self.dir.display())))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.source_err(format!("read_dir: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("eml")) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut messages = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), "Skipping unreadable spool file: {e}");
                    continue;
                }
            };
            match RawMessage::parse(&bytes) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(path = %path.display(), "Skipping unparseable spool file: {e}"),
            }
        }

        debug!(dir = %self.dir.display(), count = messages.len(), "Spool scanned");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_eml_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("002.eml"),
            b"Message-ID: <two@x.com>\r\nFrom: b@x.com\r\n\r\nsecond\r\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("001.eml"),
            b"Message-ID: <one@x.com>\r\nFrom: a@x.com\r\n\r\nfirst\r\n",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"ignored")
            .await
            .unwrap();

        let source = SpoolDirSource::new(dir.path());
        let messages = source.fetch_new().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "one@x.com");
        assert_eq!(messages[1].id, "two@x.com");

        // At-least-once: files stay and are delivered again.
        assert_eq!(source.fetch_new().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_dir_is_source_error() {
        let source = SpoolDirSource::new("/definitely/not/a/real/spool");
        let err = source.fetch_new().await.unwrap_err();
        assert!(matches!(err, PipelineError::Source { .. }));
    }
}
