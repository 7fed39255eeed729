//! Intake processor: runs one message through the pipeline stages.
//!
//! Flow per message:
//! 1. Terminal check in the audit ledger (skip redeliveries)
//! 2. Sender filter → dismiss or continue
//! 3. Archive raw bytes (when the policy is `always`)
//! 4. Reduce body → dismiss on unreadable input
//! 5. Extract facts (timeout + retry)
//! 6. Commit to the graph (retried; writes are idempotent)
//! 7. Record `complete`
//!
//! Every stage outcome is written to the audit ledger before the next stage
//! starts. A failed stage writes a `failed` record and stops the run. If the
//! ledger itself cannot be written, the run aborts with an error.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::StreamExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::{ArchivePolicy, PipelineConfig};
use crate::error::{GraphWriteError, PipelineError};
use crate::llm::provider::LlmProvider;
use crate::llm::retry::RetryPolicy;
use crate::mail::RawMessage;
use crate::pipeline::archive::ArchivalWriter;
use crate::pipeline::audit::AuditRecorder;
use crate::pipeline::extractor::{ExtractionPrompt, KnowledgeExtractor};
use crate::pipeline::filter::{self, AllowList};
use crate::pipeline::graph_writer::GraphWriter;
use crate::pipeline::reducer::BodyReducer;
use crate::pipeline::types::{
    AuditRecord, CommitResult, ExtractedFact, IntakeRun, RunOutcome, Stage, TerminalState,
};
use crate::store::{AuditStore, BlobStore, GraphStore};

/// Reason recorded when the sender filter rejects a message.
const NOT_ALLOWED: &str = "sender not in allow-list";

/// Orchestrates the intake stages for each message.
pub struct IntakeProcessor {
    reducer: BodyReducer,
    extractor: KnowledgeExtractor,
    graph: GraphWriter,
    audit: AuditRecorder,
    archive: ArchivalWriter,
    max_body_length: usize,
    archive_policy: ArchivePolicy,
    graph_retry: RetryPolicy,
    concurrency: usize,
    prompt: RwLock<ExtractionPrompt>,
    in_flight: Mutex<HashSet<String>>,
}

impl IntakeProcessor {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        graph_store: Arc<dyn GraphStore>,
        audit_store: Arc<dyn AuditStore>,
        blob_store: Arc<dyn BlobStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            reducer: BodyReducer::new(config.strip_boilerplate),
            extractor: KnowledgeExtractor::new(llm, config.extraction_timeout, config.extraction_retry)
                .with_min_confidence(config.min_confidence),
            graph: GraphWriter::new(graph_store, config.store_timeout),
            audit: AuditRecorder::new(audit_store, config.store_timeout),
            archive: ArchivalWriter::new(blob_store, config.store_timeout),
            max_body_length: config.max_body_length,
            archive_policy: config.archive_policy,
            graph_retry: config.graph_retry,
            concurrency: config.concurrency.max(1),
            prompt: RwLock::new(ExtractionPrompt::default()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the extraction prompt used by subsequent runs.
    pub fn set_prompt(&self, prompt: ExtractionPrompt) {
        *self.prompt.write().unwrap_or_else(PoisonError::into_inner) = prompt;
    }

    fn current_prompt(&self) -> ExtractionPrompt {
        self.prompt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process one delivered message.
    ///
    /// `Err` only when the audit ledger could not be written or read; every
    /// other failure is recorded and returned as `RunOutcome::Failed`.
    pub async fn process(
        &self,
        message: &RawMessage,
        allow_list: &AllowList,
    ) -> Result<RunOutcome, PipelineError> {
        info!(id = %message.id, sender = %message.sender, "Processing message");
        let Some(_claim) = self.claim(&message.id) else {
            debug!(id = %message.id, "Message already in flight, skipping duplicate");
            return Ok(RunOutcome::InFlight);
        };
        self.run(message, allow_list, false).await
    }

    /// Re-run an archived message. `Failed` messages are retried; `Done`
    /// and `Dismissed` ones are skipped.
    pub async fn reprocess(
        &self,
        message_id: &str,
        allow_list: &AllowList,
    ) -> Result<RunOutcome, PipelineError> {
        let raw = self
            .archive
            .load(message_id)
            .await?
            .ok_or_else(|| PipelineError::NotArchived(message_id.to_string()))?;
        let mut message = RawMessage::parse(&raw)?;
        message.id = message_id.to_string();
        self.reprocess_message(&message, allow_list).await
    }

    /// Re-run a message from bytes the caller still holds, e.g. a spool copy
    /// of a message whose archive write failed. Same skip rules as
    /// [`reprocess`](Self::reprocess).
    pub async fn reprocess_message(
        &self,
        message: &RawMessage,
        allow_list: &AllowList,
    ) -> Result<RunOutcome, PipelineError> {
        info!(id = %message.id, "Reprocessing message");
        let Some(_claim) = self.claim(&message.id) else {
            return Ok(RunOutcome::InFlight);
        };
        self.run(message, allow_list, true).await
    }

    /// Process a batch with bounded concurrency and record the run summary.
    ///
    /// A message whose ledger write fails is counted as failed; the batch
    /// continues.
    pub async fn process_batch(
        &self,
        source: &str,
        messages: Vec<RawMessage>,
        allow_list: Arc<AllowList>,
    ) -> Result<IntakeRun, PipelineError> {
        let mut run = IntakeRun::start(source);
        for message in &messages {
            run.observe(message.received_at);
        }
        info!(source, count = messages.len(), "Processing message batch");

        // Each future owns its message and allow-list handle.
        let outcomes: Vec<(String, Result<RunOutcome, PipelineError>)> =
            futures::stream::iter(messages)
                .map(move |message| {
                    let allow_list = Arc::clone(&allow_list);
                    async move {
                        let outcome = self.process(&message, &allow_list).await;
                        (message.id, outcome)
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(outcome) => run.tally(&outcome),
                Err(e) => {
                    error!(id, error = %e, "Message run aborted");
                    run.failed += 1;
                }
            }
        }

        run.finish();
        self.audit.record_run(&run).await?;
        info!(
            source,
            fetched = run.fetched,
            accepted = run.accepted,
            done = run.done,
            dismissed = run.dismissed,
            failed = run.failed,
            skipped = run.skipped,
            "Batch processing complete"
        );
        Ok(run)
    }

    async fn run(
        &self,
        message: &RawMessage,
        allow_list: &AllowList,
        reprocessing: bool,
    ) -> Result<RunOutcome, PipelineError> {
        let id = message.id.as_str();

        if let Some(state) = self.already_handled(id, reprocessing).await? {
            info!(id, ?state, "Message already handled, skipping");
            return Ok(RunOutcome::Skipped(state));
        }

        // Filter
        if !filter::accept(&message.sender, allow_list) {
            self.audit
                .record(
                    &AuditRecord::dismissed(id, Stage::Filter, NOT_ALLOWED)
                        .with_detail(json!({ "sender": message.sender })),
                )
                .await?;
            info!(id, sender = %message.sender, "Message dismissed by sender filter");
            return Ok(RunOutcome::Dismissed {
                stage: Stage::Filter,
                reason: NOT_ALLOWED.to_string(),
            });
        }
        self.audit
            .record(&AuditRecord::processed(id, Stage::Filter))
            .await?;

        // Archive
        if self.archive_policy == ArchivePolicy::Always {
            if let Some(skip) = self.enter(id, Stage::Archive, reprocessing).await? {
                return Ok(skip);
            }
            match self.archive.archive(id, &message.raw).await {
                Ok(written) => {
                    self.audit
                        .record(
                            &AuditRecord::processed(id, Stage::Archive)
                                .with_detail(json!({ "written": written, "bytes": message.raw.len() })),
                        )
                        .await?;
                }
                Err(e) => return self.fail(message, Stage::Archive, e.to_string(), 1).await,
            }
        }

        // Reduce
        if let Some(skip) = self.enter(id, Stage::Reduce, reprocessing).await? {
            return Ok(skip);
        }
        let reduced = match self.reducer.reduce(&message.body, self.max_body_length) {
            Ok(reduced) => reduced,
            Err(e) => {
                let reason = e.to_string();
                self.audit
                    .record(&AuditRecord::dismissed(id, Stage::Reduce, &reason))
                    .await?;
                info!(id, reason = %reason, "Message dismissed: body cannot be reduced");
                return Ok(RunOutcome::Dismissed {
                    stage: Stage::Reduce,
                    reason,
                });
            }
        };
        self.audit
            .record(&AuditRecord::processed(id, Stage::Reduce).with_detail(json!({
                "original_chars": reduced.original_chars,
                "reduced_chars": reduced.chars(),
                "savings_pct": reduced.savings_percentage(),
                "truncated": reduced.truncated,
            })))
            .await?;

        // Extract
        if let Some(skip) = self.enter(id, Stage::Extract, reprocessing).await? {
            return Ok(skip);
        }
        let prompt = self.current_prompt();
        let extraction = match self
            .extractor
            .extract(&reduced.text, message.subject.as_deref(), &prompt)
            .await
        {
            Ok(extraction) => extraction,
            Err(e) => return self.fail(message, Stage::Extract, e.reason(), e.attempts()).await,
        };
        self.audit
            .record(
                &AuditRecord::processed(id, Stage::Extract)
                    .with_detail(extraction.audit_detail())
                    .with_attempts(extraction.attempts),
            )
            .await?;

        // Commit
        if let Some(skip) = self.enter(id, Stage::Commit, reprocessing).await? {
            return Ok(skip);
        }
        let (committed, attempts) = match self.commit_with_retry(id, &extraction.facts).await {
            Ok(ok) => ok,
            Err((e, attempts)) => {
                return self.fail(message, Stage::Commit, e.reason(attempts), attempts).await;
            }
        };
        let detail = json!({
            "concepts_created": committed.concepts_created,
            "concepts_existing": committed.concepts_existing,
            "edges_created": committed.edges_created,
            "edges_existing": committed.edges_existing,
        });
        self.audit
            .record(
                &AuditRecord::processed(id, Stage::Commit)
                    .with_detail(detail.clone())
                    .with_attempts(attempts),
            )
            .await?;

        // Complete
        if let Some(skip) = self.enter(id, Stage::Complete, reprocessing).await? {
            return Ok(skip);
        }
        self.audit
            .record(&AuditRecord::processed(id, Stage::Complete).with_detail(detail))
            .await?;

        info!(
            id,
            facts = extraction.facts.len(),
            edges_created = committed.edges_created,
            "Message processed"
        );
        Ok(RunOutcome::Done(committed))
    }

    async fn commit_with_retry(
        &self,
        id: &str,
        facts: &[ExtractedFact],
    ) -> Result<(CommitResult, u32), (GraphWriteError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.graph.commit(id, facts).await {
                Ok(result) => return Ok((result, attempt)),
                Err(e @ GraphWriteError::InvalidFact(_)) => return Err((e, attempt)),
                Err(e) if self.graph_retry.has_attempts_left(attempt) => {
                    let delay = self.graph_retry.delay(attempt, None);
                    warn!(
                        id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Graph commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    /// Terminal check before entering `stage`.
    async fn enter(
        &self,
        id: &str,
        stage: Stage,
        reprocessing: bool,
    ) -> Result<Option<RunOutcome>, PipelineError> {
        debug!(id, stage = %stage, "Entering stage");
        Ok(self
            .already_handled(id, reprocessing)
            .await?
            .map(RunOutcome::Skipped))
    }

    async fn already_handled(
        &self,
        id: &str,
        reprocessing: bool,
    ) -> Result<Option<TerminalState>, PipelineError> {
        let state = self.audit.terminal(id).await?;
        Ok(state.filter(|s| s.blocks(reprocessing)))
    }

    async fn fail(
        &self,
        message: &RawMessage,
        stage: Stage,
        reason: String,
        attempts: u32,
    ) -> Result<RunOutcome, PipelineError> {
        error!(id = %message.id, stage = %stage, reason = %reason, attempts, "Message failed");
        self.audit
            .record(&AuditRecord::failed(&message.id, stage, &reason).with_attempts(attempts))
            .await?;

        if self.archive_policy == ArchivePolicy::OnFailure
            && let Err(e) = self.archive.archive(&message.id, &message.raw).await
        {
            warn!(id = %message.id, error = %e, "Failed to archive message after failure");
        }

        Ok(RunOutcome::Failed { stage, reason })
    }

    fn claim(&self, id: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(id.to_string()).then(|| InFlight {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }
}

/// Holds a message id in the in-flight set until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
