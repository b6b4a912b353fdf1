//! Entity change history.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use scenariosync_core::models::{ChangeHistoryEntry, EntityType, Page};

use crate::api::status::AppError;
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/history", get(entity_history))
}

/// Newest first; pass `next_cursor` back as `cursor` for the next page.
async fn entity_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Page<ChangeHistoryEntry>>, AppError> {
    let page = state.history.query(
        query.entity_type,
        &query.entity_id,
        query.limit.unwrap_or(50),
        query.cursor.as_deref(),
    )?;
    Ok(Json(page))
}
