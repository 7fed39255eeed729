//! Shared types for the intake pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One subject-relation-object triple extracted from a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub subject: String,
    pub relation: String,
    pub object: String,
    /// Supporting text from the message.
    #[serde(default)]
    pub excerpt: String,
    pub confidence: f32,
}

impl ExtractedFact {
    pub fn new(
        subject: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            subject: subject.into(),
            relation: relation.into(),
            object: object.into(),
            excerpt: String::new(),
            confidence,
        }
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = excerpt.into();
        self
    }
}

/// Normalize a concept label for dedup: trim, collapse inner whitespace, lowercase.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Normalize a relation name: lowercase words joined by `_`.
pub fn normalize_relation(relation: &str) -> String {
    relation
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// A deduplicated node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConcept {
    pub id: String,
    /// Label as first seen.
    pub label: String,
    pub normalized_label: String,
    pub created_at: DateTime<Utc>,
}

/// A provenance-tagged edge between two concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub subject_id: String,
    pub relation: String,
    pub object_id: String,
    pub source_message_id: String,
    pub excerpt: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

/// What a graph commit did. Re-running a commit moves counts from
/// `*_created` to `*_existing`; it never adds edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub concepts_created: usize,
    pub concepts_existing: usize,
    pub edges_created: usize,
    pub edges_existing: usize,
}

/// Pipeline stage named in audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Filter,
    Archive,
    Reduce,
    Extract,
    Commit,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Filter,
        Stage::Archive,
        Stage::Reduce,
        Stage::Extract,
        Stage::Commit,
        Stage::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Filter => "filter",
            Stage::Archive => "archive",
            Stage::Reduce => "reduce",
            Stage::Extract => "extract",
            Stage::Commit => "commit",
            Stage::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Outcome of one stage transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Processed,
    Dismissed,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Processed => "processed",
            Outcome::Dismissed => "dismissed",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Outcome::Processed),
            "dismissed" => Ok(Outcome::Dismissed),
            "failed" => Ok(Outcome::Failed),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// One audit ledger entry, keyed by `(message_id, stage)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub message_id: String,
    pub stage: Stage,
    pub outcome: Outcome,
    pub reason: Option<String>,
    /// Stage metrics (sizes, token usage, commit counts).
    pub detail: serde_json::Value,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(message_id: impl Into<String>, stage: Stage, outcome: Outcome) -> Self {
        Self {
            message_id: message_id.into(),
            stage,
            outcome,
            reason: None,
            detail: serde_json::json!({}),
            attempts: 1,
            recorded_at: Utc::now(),
        }
    }

    pub fn processed(message_id: impl Into<String>, stage: Stage) -> Self {
        Self::new(message_id, stage, Outcome::Processed)
    }

    pub fn dismissed(message_id: impl Into<String>, stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(message_id, stage, Outcome::Dismissed).with_reason(reason)
    }

    pub fn failed(message_id: impl Into<String>, stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(message_id, stage, Outcome::Failed).with_reason(reason)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// The terminal state this record represents, if any.
    pub fn terminal_state(&self) -> Option<TerminalState> {
        match (self.stage, self.outcome) {
            (Stage::Complete, Outcome::Processed) => Some(TerminalState::Done),
            (_, Outcome::Dismissed) => Some(TerminalState::Dismissed),
            (_, Outcome::Failed) => Some(TerminalState::Failed(self.stage)),
            _ => None,
        }
    }
}

/// Terminal state of a message in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum TerminalState {
    Done,
    Dismissed,
    Failed(Stage),
}

impl TerminalState {
    /// Whether a fresh delivery must be skipped. A reprocess only stops on
    /// `Done` or `Dismissed`.
    pub fn blocks(&self, reprocessing: bool) -> bool {
        match self {
            TerminalState::Done | TerminalState::Dismissed => true,
            TerminalState::Failed(_) => !reprocessing,
        }
    }
}

/// How one pipeline run for one message ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Done(CommitResult),
    Dismissed { stage: Stage, reason: String },
    Failed { stage: Stage, reason: String },
    /// Already handled: by an earlier run, or by a concurrent duplicate.
    Skipped(TerminalState),
    /// Another task in this process holds the message.
    InFlight,
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, RunOutcome::Done(_))
    }
}

/// Summary of one intake batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeRun {
    pub id: Uuid,
    pub source: String,
    pub fetched: usize,
    pub accepted: usize,
    pub done: usize,
    pub dismissed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Oldest and newest `received_at` among fetched messages.
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IntakeRun {
    pub fn start(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            fetched: 0,
            accepted: 0,
            done: 0,
            dismissed: 0,
            failed: 0,
            skipped: 0,
            window_start: None,
            window_end: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Widen the time window to include `at`.
    pub fn observe(&mut self, at: DateTime<Utc>) {
        self.fetched += 1;
        self.window_start = Some(self.window_start.map_or(at, |s| s.min(at)));
        self.window_end = Some(self.window_end.map_or(at, |e| e.max(at)));
    }

    pub fn tally(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Done(_) => {
                self.accepted += 1;
                self.done += 1;
            }
            RunOutcome::Dismissed { stage, .. } => {
                if *stage != Stage::Filter {
                    self.accepted += 1;
                }
                self.dismissed += 1;
            }
            RunOutcome::Failed { stage, .. } => {
                if *stage != Stage::Filter {
                    self.accepted += 1;
                }
                self.failed += 1;
            }
            RunOutcome::Skipped(_) | RunOutcome::InFlight => self.skipped += 1,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_normalization() {
        assert_eq!(normalize_label("  Compound   X "), "compound x");
        assert_eq!(normalize_label("CompoundX"), normalize_label("compoundx"));
        assert_eq!(normalize_relation("Is Part  Of"), "is_part_of");
    }

    #[test]
    fn stage_round_trips_through_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("bogus".parse::<Stage>().is_err());
    }

    #[test]
    fn terminal_state_of_records() {
        let done = AuditRecord::processed("m", Stage::Complete);
        assert_eq!(done.terminal_state(), Some(TerminalState::Done));
        let step = AuditRecord::processed("m", Stage::Reduce);
        assert_eq!(step.terminal_state(), None);
        let failed = AuditRecord::failed("m", Stage::Extract, "timeout");
        assert_eq!(failed.terminal_state(), Some(TerminalState::Failed(Stage::Extract)));
    }

    #[test]
    fn failed_does_not_block_reprocess() {
        assert!(TerminalState::Failed(Stage::Commit).blocks(false));
        assert!(!TerminalState::Failed(Stage::Commit).blocks(true));
        assert!(TerminalState::Done.blocks(true));
        assert!(TerminalState::Dismissed.blocks(true));
    }

    #[test]
    fn run_summary_tallies() {
        let mut run = IntakeRun::start("spool");
        let early = Utc::now() - chrono::Duration::hours(2);
        let late = Utc::now();
        run.observe(late);
        run.observe(early);
        run.tally(&RunOutcome::Done(CommitResult::default()));
        run.tally(&RunOutcome::Dismissed {
            stage: Stage::Filter,
            reason: "sender".into(),
        });
        run.finish();
        assert_eq!(run.fetched, 2);
        assert_eq!(run.accepted, 1);
        assert_eq!(run.done, 1);
        assert_eq!(run.dismissed, 1);
        assert_eq!(run.window_start, Some(early));
        assert_eq!(run.window_end, Some(late));
    }
}
