//! Graph writer: extracted facts into the knowledge graph.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::error::{DatabaseError, GraphWriteError};
use crate::pipeline::types::{CommitResult, ExtractedFact, normalize_label, normalize_relation};
use crate::store::{EdgeWrite, GraphStore};

/// Upserts concepts and provenance-tagged edges.
///
/// Safe to re-run for the same message: concepts dedup on normalized label
/// and edges on `(subject, relation, object, message_id)`.
pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
    timeout: Duration,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Commit all facts for `message_id`.
    ///
    /// Stops at the first store failure. Facts committed before it stay
    /// committed and are counted as existing on the next attempt.
    pub async fn commit(
        &self,
        message_id: &str,
        facts: &[ExtractedFact],
    ) -> Result<CommitResult, GraphWriteError> {
        let mut result = CommitResult::default();
        let now = Utc::now();

        for fact in facts {
            let subject = normalize_label(&fact.subject);
            let object = normalize_label(&fact.object);
            let relation = normalize_relation(&fact.relation);
            if subject.is_empty() || object.is_empty() || relation.is_empty() {
                return Err(GraphWriteError::InvalidFact(format!(
                    "empty label in ({}, {}, {})",
                    fact.subject, fact.relation, fact.object
                )));
            }

            for (label, normalized) in [(fact.subject.trim(), &subject), (fact.object.trim(), &object)] {
                if self
                    .bounded(self.store.upsert_concept(label, normalized))
                    .await?
                {
                    result.concepts_created += 1;
                } else {
                    result.concepts_existing += 1;
                }
            }

            let edge = EdgeWrite {
                subject: &subject,
                relation: &relation,
                object: &object,
                source_message_id: message_id,
                excerpt: &fact.excerpt,
                confidence: fact.confidence,
                created_at: now,
            };
            if self.bounded(self.store.insert_edge(&edge)).await? {
                result.edges_created += 1;
            } else {
                result.edges_existing += 1;
            }
        }

        debug!(
            id = message_id,
            concepts_created = result.concepts_created,
            edges_created = result.edges_created,
            edges_existing = result.edges_existing,
            "Facts committed"
        );
        Ok(result)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, GraphWriteError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(GraphWriteError::from),
            Err(_) => Err(GraphWriteError::Timeout(self.timeout)),
        }
    }
}
