//! Error types for the ScenarioSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Scenario graph / snapshot errors
// ---------------------------------------------------------------------------

/// Errors from the scenario graph, the entity store and the diff engine.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The requested scenario does not exist.
    #[error("scenario not found: {0}")]
    NotFound(String),

    /// A request referenced a scenario or value that is not acceptable.
    #[error("invalid scenario request: {0}")]
    Validation(String),

    /// The parent of a new scenario is missing or archived.
    #[error("invalid parent scenario '{parent_id}': {reason}")]
    InvalidParent { parent_id: String, reason: String },

    /// Linking the scenario would make it its own ancestor.
    #[error("scenario '{scenario_id}' would become its own ancestor")]
    Cycle { scenario_id: String },

    /// Archive (or merge) attempted while children are still live.
    #[error("scenario '{scenario_id}' has {count} non-archived child scenario(s)")]
    HasActiveChildren { scenario_id: String, count: usize },

    /// Writes are not accepted on archived scenarios.
    #[error("scenario '{0}' is archived")]
    Archived(String),

    /// Database error while reading or writing scenario data.
    #[error("scenario database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the merge coordinator.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Another merge or sync holds a lock on one of the scenarios involved.
    #[error("scenario '{lock_key}' is locked by operation {held_by}; retry later")]
    LockConflict { lock_key: String, held_by: String },

    /// Commit attempted while conflicts of the attempt are not resolved.
    #[error("merge {operation_id} has {pending} pending and {deferred} deferred conflict(s)")]
    ConflictPending {
        operation_id: String,
        pending: usize,
        deferred: usize,
    },

    /// The referenced merge attempt does not exist.
    #[error("merge operation not found: {0}")]
    OperationNotFound(String),

    /// The merge attempt is not in a state that allows the request.
    #[error("merge operation {operation_id} is {status}: {detail}")]
    InvalidOperationState {
        operation_id: String,
        status: String,
        detail: String,
    },

    /// Underlying scenario graph or store error.
    #[error("merge scenario error: {0}")]
    ScenarioError(#[from] ScenarioError),

    /// Database error while computing or committing the merge.
    #[error("merge database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The requested conflict ID was not found.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Attempted to resolve a conflict that is already resolved.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),

    /// The provided resolution is invalid.
    #[error("invalid resolution for conflict {id}: {detail}")]
    InvalidResolution { id: String, detail: String },

    /// The attempt that produced the conflict no longer accepts resolutions.
    #[error("conflict {id} belongs to operation {operation_id} which is {status}")]
    OperationClosed {
        id: String,
        operation_id: String,
        status: String,
    },

    /// Database error when persisting conflict data.
    #[error("conflict database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the git-backed sync orchestrator.
///
/// Failures that happen after the operation was recorded carry its id; the
/// operation row itself is left in `failed` with the message populated.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another merge or sync holds the lock.
    #[error("'{lock_key}' is locked by operation {held_by}; retry later")]
    LockConflict { lock_key: String, held_by: String },

    /// No credential is stored for the user and repository.
    #[error("no git credential for user '{user_id}' on {repository_url}")]
    CredentialMissing {
        operation_id: String,
        user_id: String,
        repository_url: String,
    },

    /// The stored credential has expired; no network call was attempted.
    #[error("git credential for user '{user_id}' expired at {expired_at}")]
    CredentialExpired {
        operation_id: String,
        user_id: String,
        expired_at: String,
    },

    /// The remote could not be reached (or timed out).
    #[error("remote unavailable: {detail}")]
    NetworkUnavailable { operation_id: String, detail: String },

    /// Push refused because the scenario has unresolved conflicts.
    #[error("scenario '{scenario_id}' has {count} unresolved conflict(s)")]
    PendingConflicts { scenario_id: String, count: usize },

    /// Push refused because the remote moved since the last sync.
    #[error("remote branch '{branch}' has advanced since the last sync; pull first")]
    RemoteAhead { operation_id: String, branch: String },

    /// The last synced state changed after the pull parked, so its fetched
    /// payload can no longer be reconciled.
    #[error("sync base of scenario '{scenario_id}' moved since operation {operation_id} stopped; pull again")]
    BaseMoved {
        operation_id: String,
        scenario_id: String,
    },

    /// The referenced sync operation does not exist.
    #[error("sync operation not found: {0}")]
    OperationNotFound(String),

    /// A state-machine transition was invalid.
    #[error("invalid sync state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Underlying git backend error.
    #[error("sync git error: {0}")]
    GitError(#[from] GitError),

    /// The fetched payload could not be accepted.
    #[error("sync payload error: {0}")]
    ExportError(#[from] ExportError),

    /// Underlying merge error (three-way reconcile of pulled state).
    #[error("sync merge error: {0}")]
    MergeError(#[from] MergeError),

    /// Underlying scenario error.
    #[error("sync scenario error: {0}")]
    ScenarioError(#[from] ScenarioError),

    /// Database error during sync.
    #[error("sync database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from git backends (libgit2 or in-memory).
#[derive(Debug, Error)]
pub enum GitError {
    /// The local mirror does not exist yet (clone first).
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// Network / transport failure talking to the remote.
    #[error("git network error: {0}")]
    Network(String),

    /// The remote rejected the supplied credentials.
    #[error("git authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Push was rejected (remote head moved or non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// The branch content is not what ScenarioSync writes.
    #[error("malformed branch content on '{branch}': {detail}")]
    MalformedBranch { branch: String, detail: String },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Export / import errors
// ---------------------------------------------------------------------------

/// Errors at the `ScenarioExportData` boundary.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The payload declares a schema version this build does not read.
    #[error("unsupported export schema version: {found}")]
    UnsupportedSchema { found: String },

    /// JSON parse failure.
    #[error("export payload parse error: {0}")]
    ParseError(String),

    /// A record in the payload lacks an id or is not an object.
    #[error("invalid {collection} record at index {index}: {detail}")]
    InvalidRecord {
        collection: String,
        index: usize,
        detail: String,
    },

    /// The target scenario cannot accept the import.
    #[error("import scenario error: {0}")]
    ScenarioError(#[from] ScenarioError),

    /// Database error while importing.
    #[error("import database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored JSON column could not be (de)serialized.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored enum column held an unknown value.
    #[error("unexpected value '{value}' in column {column}")]
    InvalidColumn { column: String, value: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ScenarioError::Cycle {
            scenario_id: "s1".into(),
        };
        assert_eq!(err.to_string(), "scenario 's1' would become its own ancestor");

        let err = MergeError::ConflictPending {
            operation_id: "op".into(),
            pending: 1,
            deferred: 2,
        };
        assert!(err.to_string().contains("1 pending and 2 deferred"));

        let err = ExportError::UnsupportedSchema { found: "7".into() };
        assert_eq!(err.to_string(), "unsupported export schema version: 7");

        let err = SyncError::CredentialExpired {
            operation_id: "op".into(),
            user_id: "alice".into(),
            expired_at: "2025-01-01T00:00:00Z".into(),
        };
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core_err: CoreError = ScenarioError::NotFound("x".into()).into();
        assert!(matches!(core_err, CoreError::Scenario(_)));

        let db_err = DatabaseError::NotFound {
            entity: "conflict".into(),
            id: "abc".into(),
        };
        let core_err: CoreError = db_err.into();
        assert!(matches!(core_err, CoreError::Database(_)));
    }
}
