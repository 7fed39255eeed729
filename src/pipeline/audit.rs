//! Audit recorder: the completion ledger in front of the audit store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::{AuditWriteError, DatabaseError};
use crate::pipeline::types::{AuditRecord, IntakeRun, TerminalState};
use crate::store::AuditStore;

/// Writes and reads audit records with a bounded timeout on every call.
///
/// Every failure is an `AuditWriteError`: the caller cannot claim success
/// for a message whose ledger state is unknown.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    timeout: Duration,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Write `entry`. Rewriting the same `(message_id, stage)` never duplicates.
    pub async fn record(&self, entry: &AuditRecord) -> Result<(), AuditWriteError> {
        self.bounded(self.store.record(entry)).await.inspect_err(|e| {
            error!(id = %entry.message_id, stage = %entry.stage, "Audit write failed: {e}");
        })?;
        debug!(
            id = %entry.message_id,
            stage = %entry.stage,
            outcome = %entry.outcome,
            "Audit recorded"
        );
        Ok(())
    }

    /// Terminal state of `message_id`, if one has been recorded.
    pub async fn terminal(&self, message_id: &str) -> Result<Option<TerminalState>, AuditWriteError> {
        let record = self.bounded(self.store.terminal(message_id)).await?;
        Ok(record.and_then(|r| r.terminal_state()))
    }

    pub async fn records_for(&self, message_id: &str) -> Result<Vec<AuditRecord>, AuditWriteError> {
        self.bounded(self.store.records_for(message_id)).await
    }

    pub async fn record_run(&self, run: &IntakeRun) -> Result<(), AuditWriteError> {
        self.bounded(self.store.record_run(run)).await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, AuditWriteError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(AuditWriteError::from),
            Err(_) => Err(AuditWriteError::Timeout(self.timeout)),
        }
    }
}
