//! libSQL backend: graph, audit ledger and settings in one database.
//!
//! Supports local file and in-memory databases. Every write is a single
//! statement, so concurrent message tasks can share the connection without
//! holding transactions open across await points.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{AuditRecord, GraphConcept, GraphEdge, IntakeRun};
use crate::store::migrations;
use crate::store::traits::{AuditStore, EdgeWrite, GraphStore, SettingsStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn count(&self, sql: &str, ctx: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?;
                Ok(u64::try_from(n).unwrap_or(0))
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{ctx}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical, lexicographically sortable timestamp format.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn optional_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn column_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Serialization(format!("bad column: {e}"))
}

const CONCEPT_COLUMNS: &str = "id, label, normalized_label, created_at";

fn row_to_concept(row: &libsql::Row) -> Result<GraphConcept, DatabaseError> {
    let created: String = row.get(3).map_err(column_err)?;
    Ok(GraphConcept {
        id: row.get(0).map_err(column_err)?,
        label: row.get(1).map_err(column_err)?,
        normalized_label: row.get(2).map_err(column_err)?,
        created_at: parse_datetime(&created),
    })
}

const EDGE_COLUMNS: &str =
    "id, subject_id, relation, object_id, source_message_id, excerpt, confidence, created_at";

fn row_to_edge(row: &libsql::Row) -> Result<GraphEdge, DatabaseError> {
    let confidence: f64 = row.get(6).map_err(column_err)?;
    let created: String = row.get(7).map_err(column_err)?;
    Ok(GraphEdge {
        id: row.get(0).map_err(column_err)?,
        subject_id: row.get(1).map_err(column_err)?,
        relation: row.get(2).map_err(column_err)?,
        object_id: row.get(3).map_err(column_err)?,
        source_message_id: row.get(4).map_err(column_err)?,
        excerpt: row.get(5).map_err(column_err)?,
        confidence: confidence as f32,
        created_at: parse_datetime(&created),
    })
}

const AUDIT_COLUMNS: &str = "message_id, stage, outcome, reason, detail, attempts, recorded_at";

/// SQL expression ordering stages the way the pipeline runs them.
const STAGE_ORDER: &str = "CASE stage WHEN 'filter' THEN 0 WHEN 'archive' THEN 1 \
     WHEN 'reduce' THEN 2 WHEN 'extract' THEN 3 WHEN 'commit' THEN 4 ELSE 5 END";

fn row_to_audit(row: &libsql::Row) -> Result<AuditRecord, DatabaseError> {
    let stage: String = row.get(1).map_err(column_err)?;
    let outcome: String = row.get(2).map_err(column_err)?;
    let detail: String = row.get(4).map_err(column_err)?;
    let attempts: i64 = row.get(5).map_err(column_err)?;
    let recorded: String = row.get(6).map_err(column_err)?;
    Ok(AuditRecord {
        message_id: row.get(0).map_err(column_err)?,
        stage: stage.parse().map_err(DatabaseError::Serialization)?,
        outcome: outcome.parse().map_err(DatabaseError::Serialization)?,
        reason: row.get(3).ok(),
        detail: serde_json::from_str(&detail).unwrap_or_else(|_| serde_json::json!({})),
        attempts: u32::try_from(attempts).unwrap_or(1),
        recorded_at: parse_datetime(&recorded),
    })
}

const RUN_COLUMNS: &str = "id, source, fetched, accepted, done, dismissed, failed, skipped, \
     window_start, window_end, started_at, finished_at";

fn row_to_run(row: &libsql::Row) -> Result<IntakeRun, DatabaseError> {
    let id: String = row.get(0).map_err(column_err)?;
    let count = |idx: i32| -> Result<usize, DatabaseError> {
        let n: i64 = row.get(idx).map_err(column_err)?;
        Ok(usize::try_from(n).unwrap_or(0))
    };
    let window_start: Option<String> = row.get(8).ok();
    let window_end: Option<String> = row.get(9).ok();
    let started: String = row.get(10).map_err(column_err)?;
    let finished: String = row.get(11).map_err(column_err)?;
    Ok(IntakeRun {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        source: row.get(1).map_err(column_err)?,
        fetched: count(2)?,
        accepted: count(3)?,
        done: count(4)?,
        dismissed: count(5)?,
        failed: count(6)?,
        skipped: count(7)?,
        window_start: window_start.as_deref().map(parse_datetime),
        window_end: window_end.as_deref().map(parse_datetime),
        started_at: parse_datetime(&started),
        finished_at: parse_datetime(&finished),
    })
}

// ── Graph ───────────────────────────────────────────────────────────

#[async_trait]
impl GraphStore for LibSqlBackend {
    async fn upsert_concept(
        &self,
        label: &str,
        normalized_label: &str,
    ) -> Result<bool, DatabaseError> {
        let created = self
            .conn()
            .execute(
                "INSERT INTO concepts (id, label, normalized_label, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (normalized_label) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    label,
                    normalized_label,
                    format_datetime(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_concept: {e}")))?;
        Ok(created > 0)
    }

    async fn insert_edge(&self, edge: &EdgeWrite<'_>) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT INTO edges (id, subject_id, relation, object_id, source_message_id, excerpt, confidence, created_at)
                 SELECT ?1, s.id, ?2, o.id, ?3, ?4, ?5, ?6
                 FROM concepts s, concepts o
                 WHERE s.normalized_label = ?7 AND o.normalized_label = ?8
                 ON CONFLICT (subject_id, relation, object_id, source_message_id) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    edge.relation,
                    edge.source_message_id,
                    edge.excerpt,
                    f64::from(edge.confidence),
                    format_datetime(&edge.created_at),
                    edge.subject,
                    edge.object,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_edge: {e}")))?;
        if inserted > 0 {
            return Ok(true);
        }

        // Nothing inserted: either a duplicate or a missing endpoint.
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM concepts WHERE normalized_label IN (?1, ?2)",
                params![edge.subject, edge.object],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_edge: {e}")))?;
        let found: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).map_err(column_err)?,
            _ => 0,
        };
        let expected = if edge.subject == edge.object { 1 } else { 2 };
        if found < expected {
            return Err(DatabaseError::Query(format!(
                "insert_edge: endpoint concept missing for '{}' -> '{}'",
                edge.subject, edge.object
            )));
        }
        Ok(false)
    }

    async fn find_concept(
        &self,
        normalized_label: &str,
    ) -> Result<Option<GraphConcept>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONCEPT_COLUMNS} FROM concepts WHERE normalized_label = ?1"),
                params![normalized_label],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_concept: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_concept(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_concept: {e}"))),
        }
    }

    async fn edges_for_message(&self, message_id: &str) -> Result<Vec<GraphEdge>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EDGE_COLUMNS} FROM edges WHERE source_message_id = ?1 ORDER BY created_at"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("edges_for_message: {e}")))?;

        let mut edges = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_edge(&row) {
                Ok(edge) => edges.push(edge),
                Err(e) => tracing::warn!("Skipping edge row: {e}"),
            }
        }
        Ok(edges)
    }

    async fn concept_count(&self) -> Result<u64, DatabaseError> {
        self.count("SELECT COUNT(*) FROM concepts", "concept_count")
            .await
    }

    async fn edge_count(&self) -> Result<u64, DatabaseError> {
        self.count("SELECT COUNT(*) FROM edges", "edge_count").await
    }
}

// ── Audit ───────────────────────────────────────────────────────────

#[async_trait]
impl AuditStore for LibSqlBackend {
    async fn record(&self, record: &AuditRecord) -> Result<(), DatabaseError> {
        let detail = serde_json::to_string(&record.detail)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO audit_records (message_id, stage, outcome, reason, detail, attempts, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (message_id, stage) DO UPDATE SET
                     outcome = excluded.outcome,
                     reason = excluded.reason,
                     detail = excluded.detail,
                     attempts = excluded.attempts,
                     recorded_at = excluded.recorded_at
                 WHERE audit_records.outcome <> 'dismissed'
                   AND NOT (audit_records.stage = 'complete' AND audit_records.outcome = 'processed')",
                params![
                    record.message_id.as_str(),
                    record.stage.as_str(),
                    record.outcome.as_str(),
                    optional_text(record.reason.clone()),
                    detail,
                    i64::from(record.attempts),
                    format_datetime(&record.recorded_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_audit: {e}")))?;

        debug!(
            id = %record.message_id,
            stage = %record.stage,
            outcome = %record.outcome,
            "Audit record written"
        );
        Ok(())
    }

    async fn records_for(&self, message_id: &str) -> Result<Vec<AuditRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_records WHERE message_id = ?1
                     ORDER BY {STAGE_ORDER}, recorded_at"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("records_for: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_audit(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping audit row: {e}"),
            }
        }
        Ok(records)
    }

    async fn terminal(&self, message_id: &str) -> Result<Option<AuditRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_records
                     WHERE message_id = ?1
                       AND ((stage = 'complete' AND outcome = 'processed')
                            OR outcome IN ('dismissed', 'failed'))
                     ORDER BY CASE outcome WHEN 'processed' THEN 0 WHEN 'dismissed' THEN 1 ELSE 2 END,
                              recorded_at DESC
                     LIMIT 1"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("terminal: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_audit(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("terminal: {e}"))),
        }
    }

    async fn record_run(&self, run: &IntakeRun) -> Result<(), DatabaseError> {
        let as_i64 = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO intake_runs ({RUN_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    run.id.to_string(),
                    run.source.as_str(),
                    as_i64(run.fetched),
                    as_i64(run.accepted),
                    as_i64(run.done),
                    as_i64(run.dismissed),
                    as_i64(run.failed),
                    as_i64(run.skipped),
                    optional_text(run.window_start.as_ref().map(format_datetime)),
                    optional_text(run.window_end.as_ref().map(format_datetime)),
                    format_datetime(&run.started_at),
                    format_datetime(&run.finished_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_run: {e}")))?;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<IntakeRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM intake_runs ORDER BY started_at DESC LIMIT ?1"),
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_run(&row) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!("Skipping run row: {e}"),
            }
        }
        Ok(runs)
    }
}

// ── Settings ────────────────────────────────────────────────────────

#[async_trait]
impl SettingsStore for LibSqlBackend {
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), DatabaseError> {
        let now = format_datetime(&Utc::now());
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value_str, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Outcome, Stage, TerminalState};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn edge<'a>(subject: &'a str, object: &'a str, message_id: &'a str) -> EdgeWrite<'a> {
        EdgeWrite {
            subject,
            relation: "inhibits",
            object,
            source_message_id: message_id,
            excerpt: "compound x inhibits y",
            confidence: 0.9,
            created_at: Utc::now(),
        }
    }

    // ── Graph ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn concept_upsert_dedups_by_normalized_label() {
        let db = test_db().await;
        assert!(db.upsert_concept("CompoundX", "compoundx").await.unwrap());
        assert!(!db.upsert_concept("COMPOUNDX", "compoundx").await.unwrap());
        assert_eq!(db.concept_count().await.unwrap(), 1);

        let concept = db.find_concept("compoundx").await.unwrap().unwrap();
        assert_eq!(concept.label, "CompoundX");
        assert!(db.find_concept("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edge_insert_is_idempotent_per_message() {
        let db = test_db().await;
        db.upsert_concept("CompoundX", "compoundx").await.unwrap();
        db.upsert_concept("Y", "y").await.unwrap();

        assert!(db.insert_edge(&edge("compoundx", "y", "m1")).await.unwrap());
        assert!(!db.insert_edge(&edge("compoundx", "y", "m1")).await.unwrap());
        assert_eq!(db.edge_count().await.unwrap(), 1);

        // Same triple from another message is separate provenance.
        assert!(db.insert_edge(&edge("compoundx", "y", "m2")).await.unwrap());
        assert_eq!(db.edge_count().await.unwrap(), 2);

        let edges = db.edges_for_message("m1").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, "inhibits");
        assert!((edges[0].confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn edge_with_missing_endpoint_errors() {
        let db = test_db().await;
        db.upsert_concept("Y", "y").await.unwrap();
        assert!(db.insert_edge(&edge("ghost", "y", "m1")).await.is_err());
        assert_eq!(db.edge_count().await.unwrap(), 0);
    }

    // ── Audit ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn audit_record_is_keyed_by_message_and_stage() {
        let db = test_db().await;
        let rec = AuditRecord::processed("m1", Stage::Filter);
        db.record(&rec).await.unwrap();
        db.record(&rec).await.unwrap();
        db.record(&AuditRecord::processed("m1", Stage::Reduce)).await.unwrap();

        let records = db.records_for("m1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, Stage::Filter);
        assert_eq!(records[1].stage, Stage::Reduce);
        assert!(db.terminal("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_stage_is_superseded_by_rerun() {
        let db = test_db().await;
        db.record(&AuditRecord::failed("m1", Stage::Extract, "timeout"))
            .await
            .unwrap();
        let terminal = db.terminal("m1").await.unwrap().unwrap();
        assert_eq!(terminal.terminal_state(), Some(TerminalState::Failed(Stage::Extract)));

        db.record(&AuditRecord::processed("m1", Stage::Extract))
            .await
            .unwrap();
        assert!(db.terminal("m1").await.unwrap().is_none());
        let records = db.records_for("m1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Processed);
    }

    #[tokio::test]
    async fn final_records_never_change() {
        let db = test_db().await;
        db.record(&AuditRecord::dismissed("m1", Stage::Filter, "sender"))
            .await
            .unwrap();
        db.record(&AuditRecord::processed("m1", Stage::Filter))
            .await
            .unwrap();
        let records = db.records_for("m1").await.unwrap();
        assert_eq!(records[0].outcome, Outcome::Dismissed);

        db.record(&AuditRecord::processed("m2", Stage::Complete))
            .await
            .unwrap();
        db.record(&AuditRecord::failed("m2", Stage::Complete, "late"))
            .await
            .unwrap();
        let terminal = db.terminal("m2").await.unwrap().unwrap();
        assert_eq!(terminal.terminal_state(), Some(TerminalState::Done));
    }

    #[tokio::test]
    async fn terminal_precedence_done_over_failed() {
        let db = test_db().await;
        db.record(&AuditRecord::failed("m1", Stage::Archive, "disk full"))
            .await
            .unwrap();
        db.record(&AuditRecord::processed("m1", Stage::Complete))
            .await
            .unwrap();
        let terminal = db.terminal("m1").await.unwrap().unwrap();
        assert_eq!(terminal.terminal_state(), Some(TerminalState::Done));
    }

    #[tokio::test]
    async fn audit_detail_and_reason_round_trip() {
        let db = test_db().await;
        let rec = AuditRecord::failed("m1", Stage::Extract, "timeout after 3 attempt(s)")
            .with_detail(serde_json::json!({"attempts": 3}))
            .with_attempts(3);
        db.record(&rec).await.unwrap();
        let stored = db.terminal("m1").await.unwrap().unwrap();
        assert_eq!(stored.reason.as_deref(), Some("timeout after 3 attempt(s)"));
        assert_eq!(stored.detail["attempts"], 3);
        assert_eq!(stored.attempts, 3);
    }

    // ── Runs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn recent_runs_newest_first() {
        let db = test_db().await;
        let mut older = IntakeRun::start("spool");
        older.started_at = Utc::now() - chrono::Duration::minutes(10);
        older.fetched = 3;
        older.window_start = Some(Utc::now() - chrono::Duration::days(1));
        db.record_run(&older).await.unwrap();
        let newer = IntakeRun::start("spool");
        db.record_run(&newer).await.unwrap();

        let runs = db.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, newer.id);
        assert_eq!(runs[1].fetched, 3);
        assert!(runs[1].window_start.is_some());
        assert!(runs[0].window_start.is_none());

        assert_eq!(db.recent_runs(1).await.unwrap().len(), 1);
    }

    // ── Settings ────────────────────────────────────────────────────

    #[tokio::test]
    async fn settings_upsert() {
        let db = test_db().await;
        assert!(db.get_setting("allowed_senders").await.unwrap().is_none());
        db.set_setting("allowed_senders", &serde_json::json!(["a.com"]))
            .await
            .unwrap();
        db.set_setting("allowed_senders", &serde_json::json!(["b.com"]))
            .await
            .unwrap();
        let value = db.get_setting("allowed_senders").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!(["b.com"]));
    }
}
