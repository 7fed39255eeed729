//! Capability traits for the stores the pipeline writes to.
//!
//! One backend may implement several (the libSQL backend implements the
//! graph, audit and settings stores); the blob store is separate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{BlobError, DatabaseError};
use crate::pipeline::types::{AuditRecord, GraphConcept, GraphEdge, IntakeRun};

/// An edge to create between two already-upserted concepts.
#[derive(Debug, Clone)]
pub struct EdgeWrite<'a> {
    pub subject: &'a str,
    pub relation: &'a str,
    pub object: &'a str,
    pub source_message_id: &'a str,
    pub excerpt: &'a str,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

/// Knowledge graph persistence.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create the concept if its normalized label is new. Returns `true` when created.
    async fn upsert_concept(&self, label: &str, normalized_label: &str)
    -> Result<bool, DatabaseError>;

    /// Create an edge between the concepts with the given normalized labels.
    ///
    /// Atomic: the edge row is written whole or not at all. Returns `false`
    /// when `(subject, relation, object, source_message_id)` already exists.
    async fn insert_edge(&self, edge: &EdgeWrite<'_>) -> Result<bool, DatabaseError>;

    async fn find_concept(&self, normalized_label: &str)
    -> Result<Option<GraphConcept>, DatabaseError>;

    async fn edges_for_message(&self, message_id: &str) -> Result<Vec<GraphEdge>, DatabaseError>;

    async fn concept_count(&self) -> Result<u64, DatabaseError>;

    async fn edge_count(&self) -> Result<u64, DatabaseError>;
}

/// The audit ledger: source of truth for message completion.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Write a record keyed by `(message_id, stage)`.
    ///
    /// A later write for the same key replaces the earlier one, except that
    /// `dismissed` records and the `processed` record at `complete` are final.
    async fn record(&self, record: &AuditRecord) -> Result<(), DatabaseError>;

    /// All records for a message in stage order.
    async fn records_for(&self, message_id: &str) -> Result<Vec<AuditRecord>, DatabaseError>;

    /// The terminal record for a message: Done over Dismissed over Failed.
    async fn terminal(&self, message_id: &str) -> Result<Option<AuditRecord>, DatabaseError>;

    async fn record_run(&self, run: &IntakeRun) -> Result<(), DatabaseError>;

    /// Most recent runs first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<IntakeRun>, DatabaseError>;
}

/// Runtime settings (allow-list, prompt, topics).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), DatabaseError>;
}

/// Write-once raw message storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` unless something is already there.
    /// Returns `true` when this call wrote the blob.
    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, BlobError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobError>;
}
