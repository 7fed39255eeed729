//! Operator endpoints: audit ledger queries and an on-demand intake run.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::pipeline::worker::IntakeRunner;
use crate::store::AuditStore;

const DEFAULT_RUN_LIMIT: usize = 10;
const MAX_RUN_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub audit: Arc<dyn AuditStore>,
    pub intake: IntakeRunner,
}

/// Build the Axum router for the operator API.
pub fn api_routes(audit: Arc<dyn AuditStore>, intake: IntakeRunner) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/runs", get(list_runs).post(trigger_run))
        .route("/api/audit/{message_id}", get(audit_records))
        .route("/api/audit/{message_id}/terminal", get(terminal_record))
        .with_state(ApiState { audit, intake })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mail-knowledge"
    }))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn list_runs(State(state): State<ApiState>, Query(query): Query<RunsQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    match state.audit.recent_runs(limit).await {
        Ok(runs) => (StatusCode::OK, Json(serde_json::json!(runs))),
        Err(e) => internal_error(e),
    }
}

/// Fetch and process the source now instead of waiting for the next tick.
async fn trigger_run(State(state): State<ApiState>) -> impl IntoResponse {
    info!(source = state.intake.source_name(), "Intake run requested via API");
    match state.intake.run_once().await {
        Ok(run) => (StatusCode::OK, Json(serde_json::json!(run))),
        Err(e) => {
            warn!(error = %e, "Requested intake run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

async fn audit_records(
    State(state): State<ApiState>,
    Path(message_id): Path<String>,
) -> impl IntoResponse {
    match state.audit.records_for(&message_id).await {
        Ok(records) if records.is_empty() => not_found(&message_id),
        Ok(records) => (StatusCode::OK, Json(serde_json::json!(records))),
        Err(e) => internal_error(e),
    }
}

async fn terminal_record(
    State(state): State<ApiState>,
    Path(message_id): Path<String>,
) -> impl IntoResponse {
    match state.audit.terminal(&message_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(serde_json::json!(record))),
        Ok(None) => not_found(&message_id),
        Err(e) => internal_error(e),
    }
}

fn not_found(message_id: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("No audit records for {message_id}")})),
    )
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %e, "Audit query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "audit store unavailable"})),
    )
}
