//! Conflict resolution actions.
//!
//! The [`ConflictResolver`] records a decision for a conflict: accept one
//! side, supply a custom value, or defer. Decisions only take effect when
//! the owning merge or pull is retried.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info};

use crate::db::{queries, Database};
use crate::errors::ConflictError;
use crate::merge::ENTITY_FIELD;
use crate::models::{Conflict, ResolutionStatus, SyncOperationStatus};

/// Named resolution strategies.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionStrategy {
    /// Keep the value of the scenario being merged (or of the local side).
    AcceptLocal,
    /// Keep the parent's (or the fetched remote's) value.
    AcceptRemote,
    /// Use a value supplied by the resolver.
    Custom(Value),
}

impl ResolutionStrategy {
    /// Parse the wire form (`accept_local`, `accept_remote`, `custom`).
    /// `custom` requires a value; a missing value is taken as `null`.
    pub fn from_parts(strategy: &str, custom_value: Option<Value>) -> Option<Self> {
        match strategy {
            "accept_local" => Some(Self::AcceptLocal),
            "accept_remote" => Some(Self::AcceptRemote),
            "custom" => Some(Self::Custom(custom_value.unwrap_or(Value::Null))),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AcceptLocal => "accept_local",
            Self::AcceptRemote => "accept_remote",
            Self::Custom(_) => "custom",
        }
    }

    /// The value this strategy picks for `conflict`.
    pub fn value_for(&self, conflict: &Conflict) -> Value {
        match self {
            Self::AcceptLocal => conflict.local_value.clone(),
            Self::AcceptRemote => conflict.remote_value.clone(),
            Self::Custom(value) => value.clone(),
        }
    }
}

pub struct ConflictResolver {
    db: Arc<Database>,
}

impl ConflictResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, conflict_id: &str) -> Result<Conflict, ConflictError> {
        self.db
            .read(|conn| queries::get_conflict(conn, conflict_id))?
            .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()))
    }

    pub fn list_for_operation(&self, operation_id: &str) -> Result<Vec<Conflict>, ConflictError> {
        Ok(self
            .db
            .read(|conn| queries::list_conflicts_for_operation(conn, operation_id))?)
    }

    /// Unresolved conflicts of halted operations on a scenario.
    pub fn outstanding_for_scenario(
        &self,
        scenario_id: &str,
    ) -> Result<Vec<Conflict>, ConflictError> {
        Ok(self
            .db
            .read(|conn| queries::outstanding_conflicts_for_scenario(conn, scenario_id))?)
    }

    /// Record a decision for a pending or deferred conflict.
    pub fn resolve(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Result<Conflict, ConflictError> {
        info!(conflict_id, resolved_by, strategy = strategy.name(), "resolving conflict");
        let conflict = self.db.transaction(|conn| {
            let mut conflict = open_conflict(conn, conflict_id)?;
            let value = strategy.value_for(&conflict);
            if conflict.field == ENTITY_FIELD && !(value.is_object() || value.is_null()) {
                return Err(ConflictError::InvalidResolution {
                    id: conflict_id.to_string(),
                    detail: "a whole-entity resolution must be an object or null".into(),
                });
            }

            conflict.resolution_status = ResolutionStatus::Resolved;
            conflict.resolved_value = Some(value);
            conflict.resolved_by = Some(resolved_by.to_string());
            conflict.resolved_at = Some(Utc::now());
            queries::update_conflict_resolution(conn, &conflict)?;
            Ok(conflict)
        })?;
        info!(
            conflict_id,
            operation_id = %conflict.sync_operation_id,
            "conflict resolved"
        );
        Ok(conflict)
    }

    /// Explicitly postpone a decision. Deferred conflicts still block commit.
    pub fn defer(&self, conflict_id: &str, deferred_by: &str) -> Result<Conflict, ConflictError> {
        info!(conflict_id, deferred_by, "deferring conflict resolution");
        let conflict = self.db.transaction(|conn| {
            let mut conflict = open_conflict(conn, conflict_id)?;
            if conflict.resolution_status == ResolutionStatus::Deferred {
                return Ok(conflict);
            }
            conflict.resolution_status = ResolutionStatus::Deferred;
            conflict.resolved_value = None;
            conflict.resolved_by = Some(deferred_by.to_string());
            conflict.resolved_at = Some(Utc::now());
            queries::update_conflict_resolution(conn, &conflict)?;
            Ok::<_, ConflictError>(conflict)
        })?;
        debug!(conflict_id, "conflict deferred");
        Ok(conflict)
    }
}

/// Load a conflict that still accepts a decision.
fn open_conflict(conn: &Connection, conflict_id: &str) -> Result<Conflict, ConflictError> {
    let conflict = queries::get_conflict(conn, conflict_id)?
        .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()))?;
    if conflict.resolution_status == ResolutionStatus::Resolved {
        return Err(ConflictError::AlreadyResolved(conflict_id.to_string()));
    }

    let operation = queries::get_sync_operation(conn, &conflict.sync_operation_id)?;
    match operation {
        Some(op) if op.status == SyncOperationStatus::Conflict => Ok(conflict),
        Some(op) => Err(ConflictError::OperationClosed {
            id: conflict_id.to_string(),
            operation_id: op.id,
            status: op.status.to_string(),
        }),
        None => Err(ConflictError::OperationClosed {
            id: conflict_id.to_string(),
            operation_id: conflict.sync_operation_id.clone(),
            status: "missing".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, SyncOperation, SyncOperationType};
    use serde_json::json;

    fn setup_db_with_conflict(field: &str) -> (Arc<Database>, SyncOperation, Conflict) {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();

        let mut op = SyncOperation::begin(SyncOperationType::Merge, "alice", None, None);
        op.advance(SyncOperationStatus::InProgress);
        op.advance(SyncOperationStatus::Conflict);
        let conflict = Conflict {
            id: "c1".into(),
            sync_operation_id: op.id.clone(),
            entity_type: EntityType::Assignment,
            entity_id: "a1".into(),
            entity_name: Some("Ada on Apollo".into()),
            field: field.into(),
            base_value: json!(50),
            local_value: json!(60),
            remote_value: json!(70),
            resolution_status: ResolutionStatus::Pending,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        {
            let conn = db.conn();
            queries::insert_sync_operation(&conn, &op).unwrap();
            queries::insert_conflict(&conn, &conflict).unwrap();
        }
        (db, op, conflict)
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            ResolutionStrategy::from_parts("accept_local", None),
            Some(ResolutionStrategy::AcceptLocal)
        );
        assert_eq!(
            ResolutionStrategy::from_parts("custom", Some(json!(65))),
            Some(ResolutionStrategy::Custom(json!(65)))
        );
        assert_eq!(ResolutionStrategy::from_parts("accept_theirs", None), None);
    }

    #[test]
    fn test_accept_remote_then_already_resolved() {
        let (db, _, _) = setup_db_with_conflict("allocation_percentage");
        let resolver = ConflictResolver::new(db);

        let resolved = resolver
            .resolve("c1", ResolutionStrategy::AcceptRemote, "bob")
            .unwrap();
        assert_eq!(resolved.resolution_status, ResolutionStatus::Resolved);
        assert_eq!(resolved.resolved_value, Some(json!(70)));
        assert_eq!(resolved.resolved_by.as_deref(), Some("bob"));
        assert!(resolved.resolved_at.is_some());

        let err = resolver
            .resolve("c1", ResolutionStrategy::AcceptLocal, "bob")
            .unwrap_err();
        assert!(matches!(err, ConflictError::AlreadyResolved(_)));
        assert!(matches!(
            resolver.defer("c1", "bob").unwrap_err(),
            ConflictError::AlreadyResolved(_)
        ));
    }

    #[test]
    fn test_defer_then_resolve() {
        let (db, _, _) = setup_db_with_conflict("allocation_percentage");
        let resolver = ConflictResolver::new(db);

        let deferred = resolver.defer("c1", "carol").unwrap();
        assert_eq!(deferred.resolution_status, ResolutionStatus::Deferred);
        assert!(deferred.resolved_value.is_none());

        let resolved = resolver
            .resolve("c1", ResolutionStrategy::Custom(json!(65)), "carol")
            .unwrap();
        assert_eq!(resolved.resolved_value, Some(json!(65)));
    }

    #[test]
    fn test_defer_twice_keeps_first_stamp() {
        let (db, _, _) = setup_db_with_conflict("notes");
        let resolver = ConflictResolver::new(db);

        resolver.defer("c1", "carol").unwrap();
        let second = resolver.defer("c1", "dave").unwrap();
        assert_eq!(second.resolution_status, ResolutionStatus::Deferred);
        assert_eq!(second.resolved_by.as_deref(), Some("carol"));
    }

    #[test]
    fn test_entity_conflict_requires_row_or_null() {
        let (db, _, _) = setup_db_with_conflict(ENTITY_FIELD);
        let resolver = ConflictResolver::new(db);

        let err = resolver
            .resolve("c1", ResolutionStrategy::Custom(json!(5)), "bob")
            .unwrap_err();
        assert!(matches!(err, ConflictError::InvalidResolution { .. }));
        assert!(resolver
            .resolve("c1", ResolutionStrategy::Custom(Value::Null), "bob")
            .is_ok());
    }

    #[test]
    fn test_closed_operation_rejects_resolution() {
        let (db, mut op, _) = setup_db_with_conflict("allocation_percentage");
        op.fail("abandoned by alice");
        queries::update_sync_operation(&db.conn(), &op).unwrap();

        let resolver = ConflictResolver::new(Arc::clone(&db));
        let err = resolver
            .resolve("c1", ResolutionStrategy::AcceptLocal, "bob")
            .unwrap_err();
        assert!(matches!(err, ConflictError::OperationClosed { .. }));
        assert!(matches!(
            resolver.get("missing").unwrap_err(),
            ConflictError::NotFound(_)
        ));
        assert_eq!(resolver.list_for_operation(&op.id).unwrap().len(), 1);
    }
}
