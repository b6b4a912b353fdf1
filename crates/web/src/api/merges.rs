//! Merging scenario branches into their parents.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use scenariosync_core::models::{
    ChangeHistoryEntry, Conflict, SyncOperation, SyncOperationStatus,
};
use scenariosync_core::MergeOutcome;

use crate::api::auth::Caller;
use crate::api::status::AppError;
use crate::AppState;

/// A merge attempt and what it produced.
#[derive(Serialize)]
pub struct MergeView {
    pub committed: bool,
    pub operation: SyncOperation,
    pub conflicts: Vec<Conflict>,
    pub history: Option<ChangeHistoryEntry>,
}

impl From<MergeOutcome> for MergeView {
    fn from(outcome: MergeOutcome) -> Self {
        Self {
            committed: outcome.is_committed(),
            operation: outcome.operation,
            conflicts: outcome.conflicts,
            history: outcome.history,
        }
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/scenarios/:id/merge", post(merge_scenario))
        .route("/api/merges/:operation_id", get(get_merge))
        .route("/api/merges/:operation_id/retry", post(retry_merge))
        .route("/api/merges/:operation_id/abandon", post(abandon_merge))
}

async fn merge_scenario(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<MergeView>, AppError> {
    let outcome = state.merges.merge(&id, caller.as_str())?;
    info!(
        scenario_id = %id,
        operation_id = %outcome.operation.id,
        committed = outcome.is_committed(),
        "merge requested via API"
    );
    Ok(Json(outcome.into()))
}

async fn get_merge(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<String>,
) -> Result<Json<MergeView>, AppError> {
    let operation = state.merges.operation(&operation_id)?;
    let conflicts = state.resolver.list_for_operation(&operation_id)?;
    Ok(Json(MergeView {
        committed: operation.status == SyncOperationStatus::Completed,
        operation,
        conflicts,
        history: None,
    }))
}

async fn retry_merge(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(operation_id): Path<String>,
) -> Result<Json<MergeView>, AppError> {
    Ok(Json(state.merges.retry(&operation_id, caller.as_str())?.into()))
}

async fn abandon_merge(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(operation_id): Path<String>,
) -> Result<Json<SyncOperation>, AppError> {
    Ok(Json(state.merges.abandon(&operation_id, caller.as_str())?))
}
