//! Scenario lifecycle, entity editing, comparison, export and import.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use scenariosync_core::errors::ScenarioError;
use scenariosync_core::models::{
    BranchMetadata, ChangeHistoryEntry, EntityType, Page, Scenario, ScenarioType,
};
use scenariosync_core::store::{EntityEdit, EntityFields};
use scenariosync_core::{Diff, NewScenario, ScenarioExportData};

use crate::api::auth::Caller;
use crate::api::status::AppError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScenarioRequest {
    pub name: String,
    /// Omit to create a root baseline.
    pub parent_id: Option<String>,
    pub scenario_type: Option<ScenarioType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Serialize)]
pub struct ScenarioView {
    #[serde(flatten)]
    pub scenario: Scenario,
    pub branch: Option<BranchMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitiesQuery {
    pub entity_type: Option<EntityType>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntityView {
    entity_type: EntityType,
    entity_id: String,
    fields: EntityFields,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntitiesResponse {
    scenario_id: String,
    count: usize,
    entities: Vec<EntityView>,
}

#[derive(Deserialize)]
pub struct EditRequest {
    pub edits: Vec<EntityEdit>,
    pub message: Option<String>,
}

/// Result of a write: the history entry, absent when nothing changed.
#[derive(Serialize)]
pub struct WriteResponse {
    pub changed: bool,
    pub history: Option<ChangeHistoryEntry>,
}

impl From<Option<ChangeHistoryEntry>> for WriteResponse {
    fn from(history: Option<ChangeHistoryEntry>) -> Self {
        Self {
            changed: history.is_some(),
            history,
        }
    }
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/scenarios", get(list_scenarios).post(create_scenario))
        .route("/api/scenarios/:id", get(get_scenario))
        .route("/api/scenarios/:id/activate", post(activate))
        .route("/api/scenarios/:id/archive", post(archive))
        .route("/api/scenarios/:id/ancestors", get(ancestors))
        .route("/api/scenarios/:id/compare/:other_id", get(compare))
        .route("/api/scenarios/:id/entities", get(list_entities).post(edit_entities))
        .route("/api/scenarios/:id/export", get(export_scenario))
        .route("/api/scenarios/:id/import", post(import_scenario))
        .route("/api/scenarios/:id/history", get(scenario_history))
}

fn view(state: &AppState, scenario: Scenario) -> Result<ScenarioView, AppError> {
    let branch = match state.graph.branch(&scenario.id) {
        Ok(branch) => Some(branch),
        Err(ScenarioError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(ScenarioView { scenario, branch })
}

async fn create_scenario(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<CreateScenarioRequest>,
) -> Result<(StatusCode, Json<ScenarioView>), AppError> {
    let request = match body.parent_id.as_deref() {
        None => {
            if body.scenario_type.is_some_and(|t| t != ScenarioType::Baseline) {
                return Err(AppError::BadRequest(
                    "only baseline scenarios can be created without a parent".into(),
                ));
            }
            NewScenario::root(&body.name, caller.as_str())
        }
        Some(parent) => NewScenario::branch(
            parent,
            body.scenario_type.unwrap_or(ScenarioType::WhatIf),
            &body.name,
            caller.as_str(),
        ),
    };
    let scenario = state.graph.create(request)?;
    info!(scenario_id = %scenario.id, user = %caller.as_str(), "scenario created via API");
    Ok((StatusCode::CREATED, Json(view(&state, scenario)?)))
}

async fn list_scenarios(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Scenario>>, AppError> {
    Ok(Json(state.graph.list(query.include_archived)?))
}

async fn get_scenario(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScenarioView>, AppError> {
    let scenario = state.graph.get(&id)?;
    Ok(Json(view(&state, scenario)?))
}

async fn activate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Scenario>, AppError> {
    Ok(Json(state.graph.activate(&id)?))
}

async fn archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Scenario>, AppError> {
    Ok(Json(state.graph.archive(&id)?))
}

async fn ancestors(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Scenario>>, AppError> {
    Ok(Json(state.graph.ancestors_of(&id)?))
}

async fn compare(
    State(state): State<Arc<AppState>>,
    Path((id, other_id)): Path<(String, String)>,
) -> Result<Json<Diff>, AppError> {
    Ok(Json(state.diff.compare(&id, &other_id)?))
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

async fn list_entities(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EntitiesQuery>,
) -> Result<Json<EntitiesResponse>, AppError> {
    let snapshot = state.store.snapshot(&id)?;
    let entities: Vec<EntityView> = snapshot
        .iter()
        .filter(|(key, _)| query.entity_type.map_or(true, |t| key.entity_type == t))
        .map(|(key, fields)| EntityView {
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            fields: fields.clone(),
        })
        .collect();
    Ok(Json(EntitiesResponse {
        scenario_id: id,
        count: entities.len(),
        entities,
    }))
}

async fn edit_entities(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<EditRequest>,
) -> Result<Json<WriteResponse>, AppError> {
    if body.edits.is_empty() {
        return Err(AppError::BadRequest("edit batch is empty".into()));
    }
    let message = body
        .message
        .unwrap_or_else(|| format!("Edit {} entities", body.edits.len()));
    let entry = state
        .store
        .apply_batch(&id, &body.edits, caller.as_str(), &message)?;
    Ok(Json(entry.into()))
}

// ---------------------------------------------------------------------------
// Export / import / history
// ---------------------------------------------------------------------------

async fn export_scenario(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<ScenarioExportData>, AppError> {
    Ok(Json(state.exporter.export(&id, caller.as_str())?))
}

/// Takes the raw body so the schema version is checked before the shape.
async fn import_scenario(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    body: String,
) -> Result<Json<WriteResponse>, AppError> {
    let data = ScenarioExportData::decode(&body)?;
    let entry = state.exporter.import(&id, &data, caller.as_str())?;
    Ok(Json(entry.into()))
}

async fn scenario_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<ChangeHistoryEntry>>, AppError> {
    state.graph.get(&id)?;
    let page = state.history.for_scenario(
        &id,
        query.limit.unwrap_or(50),
        query.cursor.as_deref(),
    )?;
    Ok(Json(page))
}
