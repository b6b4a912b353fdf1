//! Conflict management API endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use scenariosync_core::models::Conflict;
use scenariosync_core::ResolutionStrategy;

use crate::api::auth::Caller;
use crate::api::status::AppError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConflictsQuery {
    /// Conflicts of one merge or pull attempt.
    pub sync_operation_id: Option<String>,
    /// Unresolved conflicts of halted operations on a scenario.
    pub scenario_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    /// `accept_local`, `accept_remote` or `custom`.
    pub strategy: String,
    pub custom_value: Option<Value>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/conflicts", get(list_conflicts))
        .route("/api/conflicts/:id", get(get_conflict))
        .route("/api/conflicts/:id/resolve", post(resolve_conflict))
        .route("/api/conflicts/:id/defer", post(defer_conflict))
}

async fn list_conflicts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListConflictsQuery>,
) -> Result<Json<Vec<Conflict>>, AppError> {
    let conflicts = match (query.sync_operation_id, query.scenario_id) {
        (Some(operation_id), _) => state.resolver.list_for_operation(&operation_id)?,
        (None, Some(scenario_id)) => state.resolver.outstanding_for_scenario(&scenario_id)?,
        (None, None) => {
            return Err(AppError::BadRequest(
                "syncOperationId or scenarioId is required".into(),
            ))
        }
    };
    Ok(Json(conflicts))
}

async fn get_conflict(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Conflict>, AppError> {
    Ok(Json(state.resolver.get(&id)?))
}

async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<ResolveConflictRequest>,
) -> Result<Json<Conflict>, AppError> {
    let strategy = ResolutionStrategy::from_parts(&body.strategy, body.custom_value)
        .ok_or_else(|| {
            AppError::BadRequest(format!(
                "invalid strategy '{}': must be accept_local, accept_remote, or custom",
                body.strategy
            ))
        })?;
    Ok(Json(state.resolver.resolve(&id, strategy, caller.as_str())?))
}

async fn defer_conflict(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Conflict>, AppError> {
    Ok(Json(state.resolver.defer(&id, caller.as_str())?))
}
