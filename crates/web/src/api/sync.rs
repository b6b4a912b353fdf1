//! Git sync endpoints. Each call runs one sync operation to completion and
//! returns its final state.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use scenariosync_core::models::{ChangeHistoryEntry, Conflict, SyncOperation};
use scenariosync_core::SyncOutcome;

use crate::api::auth::Caller;
use crate::api::status::AppError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioRequest {
    pub scenario_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsQuery {
    pub scenario_id: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Serialize)]
pub struct SyncView {
    pub operation: SyncOperation,
    pub conflicts: Vec<Conflict>,
    pub history: Option<ChangeHistoryEntry>,
}

impl From<SyncOutcome> for SyncView {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            operation: outcome.operation,
            conflicts: outcome.conflicts,
            history: outcome.history,
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sync/clone", post(clone_remote))
        .route("/api/sync/pull", post(pull))
        .route("/api/sync/push", post(push))
        .route("/api/sync/operations", get(list_operations))
        .route("/api/sync/operations/:id", get(get_operation))
        .route("/api/sync/operations/:id/resume", post(resume))
}

async fn clone_remote(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<SyncView>, AppError> {
    Ok(Json(state.sync.clone_remote(caller.as_str()).await?.into()))
}

async fn pull(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<ScenarioRequest>,
) -> Result<Json<SyncView>, AppError> {
    Ok(Json(state.sync.pull(&body.scenario_id, caller.as_str()).await?.into()))
}

async fn push(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<ScenarioRequest>,
) -> Result<Json<SyncView>, AppError> {
    Ok(Json(state.sync.push(&body.scenario_id, caller.as_str()).await?.into()))
}

async fn list_operations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OperationsQuery>,
) -> Result<Json<Vec<SyncOperation>>, AppError> {
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(
        state
            .sync
            .list_operations(query.scenario_id.as_deref(), limit)?,
    ))
}

async fn get_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SyncView>, AppError> {
    let operation = state.sync.operation(&id)?;
    let conflicts = state.resolver.list_for_operation(&id)?;
    Ok(Json(SyncView {
        operation,
        conflicts,
        history: None,
    }))
}

async fn resume(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<SyncView>, AppError> {
    Ok(Json(state.sync.resume(&id, caller.as_str()).await?.into()))
}
