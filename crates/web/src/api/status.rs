//! Health endpoint and the error type shared by all handlers.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use scenariosync_core::errors::{
    ConflictError, DatabaseError, ExportError, MergeError, ScenarioError, SyncError,
};

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/health", get(health_check))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Shared error type for API handlers
// ---------------------------------------------------------------------------

/// API error that converts to a JSON `{"error": ...}` response.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    /// Lock held, conflicts outstanding, or the target is in the wrong state.
    Conflict(String),
    /// The payload is well-formed but cannot be accepted (schema version).
    Unprocessable(String),
    /// The git remote or the caller's credential failed.
    BadGateway(String),
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::Unprocessable(msg)
            | AppError::BadGateway(msg)
            | AppError::Internal(msg) => msg,
        };
        if status.is_server_error() {
            error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<ScenarioError> for AppError {
    fn from(err: ScenarioError) -> Self {
        let msg = err.to_string();
        match err {
            ScenarioError::NotFound(_) => AppError::NotFound(msg),
            ScenarioError::Validation(_)
            | ScenarioError::InvalidParent { .. }
            | ScenarioError::Cycle { .. } => AppError::BadRequest(msg),
            ScenarioError::HasActiveChildren { .. } | ScenarioError::Archived(_) => {
                AppError::Conflict(msg)
            }
            ScenarioError::DatabaseError(_) => AppError::Internal(msg),
        }
    }
}

impl From<MergeError> for AppError {
    fn from(err: MergeError) -> Self {
        let msg = err.to_string();
        match err {
            MergeError::LockConflict { .. }
            | MergeError::ConflictPending { .. }
            | MergeError::InvalidOperationState { .. } => AppError::Conflict(msg),
            MergeError::OperationNotFound(_) => AppError::NotFound(msg),
            MergeError::ScenarioError(inner) => inner.into(),
            MergeError::DatabaseError(_) => AppError::Internal(msg),
        }
    }
}

impl From<ConflictError> for AppError {
    fn from(err: ConflictError) -> Self {
        let msg = err.to_string();
        match err {
            ConflictError::NotFound(_) => AppError::NotFound(msg),
            ConflictError::InvalidResolution { .. } => AppError::BadRequest(msg),
            ConflictError::AlreadyResolved(_) | ConflictError::OperationClosed { .. } => {
                AppError::Conflict(msg)
            }
            ConflictError::DatabaseError(_) => AppError::Internal(msg),
        }
    }
}

impl From<ExportError> for AppError {
    fn from(err: ExportError) -> Self {
        let msg = err.to_string();
        match err {
            ExportError::UnsupportedSchema { .. } => AppError::Unprocessable(msg),
            ExportError::ParseError(_) | ExportError::InvalidRecord { .. } => {
                AppError::BadRequest(msg)
            }
            ExportError::ScenarioError(inner) => inner.into(),
            ExportError::DatabaseError(_) => AppError::Internal(msg),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let msg = err.to_string();
        match err {
            SyncError::LockConflict { .. }
            | SyncError::PendingConflicts { .. }
            | SyncError::RemoteAhead { .. }
            | SyncError::BaseMoved { .. }
            | SyncError::InvalidStateTransition { .. } => AppError::Conflict(msg),
            SyncError::CredentialMissing { .. }
            | SyncError::CredentialExpired { .. }
            | SyncError::NetworkUnavailable { .. }
            | SyncError::GitError(_) => AppError::BadGateway(msg),
            SyncError::OperationNotFound(_) => AppError::NotFound(msg),
            SyncError::ExportError(inner) => inner.into(),
            SyncError::MergeError(inner) => inner.into(),
            SyncError::ScenarioError(inner) => inner.into(),
            SyncError::DatabaseError(_) => AppError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err: AppError = ScenarioError::NotFound("s".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: AppError = MergeError::ScenarioError(ScenarioError::HasActiveChildren {
            scenario_id: "s".into(),
            count: 2,
        })
        .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err: AppError = SyncError::ExportError(ExportError::UnsupportedSchema {
            found: "2".into(),
        })
        .into();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err: AppError = SyncError::CredentialExpired {
            operation_id: "op".into(),
            user_id: "alice".into(),
            expired_at: "2025-01-01T00:00:00Z".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
