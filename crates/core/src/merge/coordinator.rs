//! Drives merge attempts of a child scenario into its parent.
//!
//! An attempt is a `merge` [`SyncOperation`]: it locks child and parent,
//! computes the three-way plan (parent at branch time, child now, parent
//! now) and either commits everything in one transaction or parks the
//! operation in `conflict` with typed conflict records and no writes.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use super::lock::{scenario_key, LockGuard, LockManager};
use super::three_way;
use crate::db::{queries, Database};
use crate::errors::{MergeError, ScenarioError};
use crate::history;
use crate::models::{
    ChangeHistoryEntry, Conflict, MergeStatus, ResolutionStatus, Scenario, ScenarioStatus,
    SyncOperation, SyncOperationStatus, SyncOperationType,
};
use crate::store::{load_snapshot, write_snapshot};

/// Result of a merge attempt.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub operation: SyncOperation,
    /// Conflicts raised by this attempt (empty when it committed).
    pub conflicts: Vec<Conflict>,
    /// History entry of the commit; `None` when halted or nothing changed.
    pub history: Option<ChangeHistoryEntry>,
}

impl MergeOutcome {
    pub fn is_committed(&self) -> bool {
        self.operation.status == SyncOperationStatus::Completed
    }
}

pub struct MergeCoordinator {
    db: Arc<Database>,
    locks: LockManager,
    max_depth: usize,
}

impl MergeCoordinator {
    pub fn new(db: Arc<Database>, lock_stale_after_secs: u64, max_depth: usize) -> Self {
        Self {
            locks: LockManager::new(Arc::clone(&db), lock_stale_after_secs),
            db,
            max_depth,
        }
    }

    pub fn operation(&self, operation_id: &str) -> Result<SyncOperation, MergeError> {
        let op = self
            .db
            .read(|conn| queries::get_sync_operation(conn, operation_id))?
            .filter(|op| op.operation_type == SyncOperationType::Merge)
            .ok_or_else(|| MergeError::OperationNotFound(operation_id.to_string()))?;
        Ok(op)
    }

    /// Merge `child_id` into its parent.
    pub fn merge(&self, child_id: &str, user: &str) -> Result<MergeOutcome, MergeError> {
        let child = self
            .db
            .read(|conn| queries::get_scenario(conn, child_id))?
            .ok_or_else(|| ScenarioError::NotFound(child_id.to_string()))?;
        let parent_id = child.parent_scenario_id.clone().ok_or_else(|| {
            ScenarioError::Validation(format!(
                "scenario '{child_id}' is a root and has no parent to merge into"
            ))
        })?;

        let mut op = SyncOperation::begin(
            SyncOperationType::Merge,
            user,
            Some(child.id.clone()),
            Some(parent_id.clone()),
        );
        let guard = self.lock(&child.id, &parent_id, &op.id)?;
        info!(
            operation_id = %op.id,
            child_id = %child.id,
            parent_id = %parent_id,
            user,
            "merge started"
        );

        self.db.transaction(|conn| {
            check_mergeable(conn, &child.id)?;
            if let Some(parked) = queries::parked_operations(conn, &child.id)?
                .into_iter()
                .find(|p| p.operation_type == SyncOperationType::Merge)
            {
                return Err(invalid_state(
                    &parked,
                    "a merge of this scenario is halted on conflicts; retry or abandon it first",
                ));
            }
            queries::insert_sync_operation(conn, &op)?;
            advance(&mut op, SyncOperationStatus::InProgress)?;
            queries::update_sync_operation(conn, &op)?;
            Ok::<_, MergeError>(())
        })?;

        let outcome = self.attempt(op, &[], user);
        drop(guard);
        outcome
    }

    /// Re-run a halted merge once every one of its conflicts is resolved.
    pub fn retry(&self, operation_id: &str, user: &str) -> Result<MergeOutcome, MergeError> {
        let op = self.operation(operation_id)?;
        let (child_id, parent_id) = scenarios_of(&op)?;
        let guard = self.lock(&child_id, &parent_id, &op.id)?;

        let (op, recorded) = self.db.transaction(|conn| {
            let mut op = queries::get_sync_operation(conn, operation_id)?
                .ok_or_else(|| MergeError::OperationNotFound(operation_id.to_string()))?;
            if op.status != SyncOperationStatus::Conflict {
                return Err(invalid_state(&op, "only a merge halted on conflicts can be retried"));
            }
            let recorded = queries::list_conflicts_for_operation(conn, operation_id)?;
            let pending = count(&recorded, ResolutionStatus::Pending);
            let deferred = count(&recorded, ResolutionStatus::Deferred);
            if pending + deferred > 0 {
                return Err(MergeError::ConflictPending {
                    operation_id: operation_id.to_string(),
                    pending,
                    deferred,
                });
            }
            advance(&mut op, SyncOperationStatus::InProgress)?;
            queries::update_sync_operation(conn, &op)?;
            Ok::<_, MergeError>((op, recorded))
        })?;
        info!(operation_id, user, resolutions = recorded.len(), "merge retried");

        let outcome = self.attempt(op, &recorded, user);
        drop(guard);
        outcome
    }

    /// Give up on a halted merge. Nothing was written, so only the
    /// operation record changes.
    pub fn abandon(&self, operation_id: &str, user: &str) -> Result<SyncOperation, MergeError> {
        let op = self.db.transaction(|conn| {
            let mut op = queries::get_sync_operation(conn, operation_id)?
                .filter(|op| op.operation_type == SyncOperationType::Merge)
                .ok_or_else(|| MergeError::OperationNotFound(operation_id.to_string()))?;
            if op.status != SyncOperationStatus::Conflict {
                return Err(invalid_state(&op, "only a merge halted on conflicts can be abandoned"));
            }
            op.fail(format!("abandoned by {user}"));
            queries::update_sync_operation(conn, &op)?;
            queries::delete_locks_for_operation(conn, operation_id)?;
            Ok::<_, MergeError>(op)
        })?;
        info!(operation_id, user, "merge abandoned");
        Ok(op)
    }

    fn lock(
        &self,
        child_id: &str,
        parent_id: &str,
        operation_id: &str,
    ) -> Result<LockGuard, MergeError> {
        let keys = [scenario_key(child_id), scenario_key(parent_id)];
        self.locks.acquire::<MergeError>(&keys, operation_id).map_err(|err| {
            warn!(operation_id, child_id, error = %err, "merge refused");
            err
        })
    }

    /// Compute and either commit or halt. Runs with the locks held and the
    /// operation `in-progress`; any error marks the operation failed.
    fn attempt(
        &self,
        mut op: SyncOperation,
        recorded: &[Conflict],
        user: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let operation_id = op.id.clone();
        let result: Result<MergeOutcome, MergeError> = self.db.transaction(|conn| {
            let (child, parent) = check_mergeable(conn, op.scenario_id.as_deref().unwrap_or(""))?;
            let base = load_snapshot(
                conn,
                &parent.id,
                Some(child.branched_at_revision),
                self.max_depth,
            )?;
            let local = load_snapshot(conn, &child.id, None, self.max_depth)?;
            let remote = load_snapshot(conn, &parent.id, None, self.max_depth)?;

            let mut plan = three_way::merge(&base, &local, &remote);
            plan.apply_recorded(recorded);

            if !plan.is_clean() {
                let conflicts: Vec<Conflict> =
                    plan.conflicts.iter().map(|c| c.to_record(&op.id)).collect();
                for conflict in &conflicts {
                    queries::insert_conflict(conn, conflict)?;
                }
                advance(&mut op, SyncOperationStatus::Conflict)?;
                op.conflict_count = (recorded.len() + conflicts.len()) as i64;
                queries::update_sync_operation(conn, &op)?;
                return Ok(MergeOutcome {
                    operation: op.clone(),
                    conflicts,
                    history: None,
                });
            }

            let diff = write_snapshot(conn, &parent.id, &remote, &plan.merged)?;
            let now = Utc::now();
            queries::update_scenario_status(conn, &child.id, ScenarioStatus::Archived, &now)?;
            queries::update_merge_status(conn, &child.id, MergeStatus::Merged)?;
            let history = if diff.is_empty() {
                None
            } else {
                let message = format!("Merge scenario '{}' into '{}'", child.name, parent.name);
                let entry = history::entry_for_diff(
                    &parent.id,
                    Some(&op.id),
                    user,
                    &message,
                    &diff,
                    None,
                    now,
                );
                Some(history::record_in(conn, entry)?)
            };
            advance(&mut op, SyncOperationStatus::Completed)?;
            queries::update_sync_operation(conn, &op)?;
            Ok(MergeOutcome {
                operation: op.clone(),
                conflicts: Vec::new(),
                history,
            })
        });

        match &result {
            Ok(outcome) if outcome.is_committed() => info!(
                operation_id = %operation_id,
                entities = outcome.history.as_ref().map(|h| h.entities_affected.len()).unwrap_or(0),
                "merge committed"
            ),
            Ok(outcome) => warn!(
                operation_id = %operation_id,
                conflicts = outcome.conflicts.len(),
                "merge halted on conflicts"
            ),
            Err(err) => self.fail_operation(&operation_id, &err.to_string()),
        }
        result
    }

    fn fail_operation(&self, operation_id: &str, message: &str) {
        let result = self.db.transaction(|conn| {
            if let Some(mut op) = queries::get_sync_operation(conn, operation_id)? {
                if op.fail(message) {
                    queries::update_sync_operation(conn, &op)?;
                }
            }
            Ok::<_, MergeError>(())
        });
        match result {
            Ok(()) => warn!(operation_id, error = message, "merge failed"),
            Err(e) => warn!(operation_id, error = %e, "could not record merge failure"),
        }
    }
}

/// Load child and parent and check that the child can be merged now.
fn check_mergeable(conn: &Connection, child_id: &str) -> Result<(Scenario, Scenario), MergeError> {
    let child = queries::get_scenario(conn, child_id)?
        .ok_or_else(|| ScenarioError::NotFound(child_id.to_string()))?;
    if child.is_archived() {
        return Err(ScenarioError::Archived(child.id).into());
    }
    let parent_id = child.parent_scenario_id.clone().ok_or_else(|| {
        ScenarioError::Validation(format!("scenario '{child_id}' has no parent"))
    })?;
    let parent = queries::get_scenario(conn, &parent_id)?.ok_or_else(|| {
        ScenarioError::InvalidParent {
            parent_id: parent_id.clone(),
            reason: "parent scenario does not exist".into(),
        }
    })?;
    if parent.is_archived() {
        return Err(ScenarioError::InvalidParent {
            parent_id,
            reason: "parent scenario is archived".into(),
        }
        .into());
    }
    let live = queries::count_live_children(conn, child_id)?;
    if live > 0 {
        return Err(ScenarioError::HasActiveChildren {
            scenario_id: child_id.to_string(),
            count: live,
        }
        .into());
    }
    Ok((child, parent))
}

fn scenarios_of(op: &SyncOperation) -> Result<(String, String), MergeError> {
    match (&op.scenario_id, &op.target_scenario_id) {
        (Some(child), Some(parent)) => Ok((child.clone(), parent.clone())),
        _ => Err(invalid_state(op, "merge operation does not name its scenarios")),
    }
}

fn advance(op: &mut SyncOperation, next: SyncOperationStatus) -> Result<(), MergeError> {
    if op.advance(next) {
        Ok(())
    } else {
        Err(invalid_state(op, &format!("cannot move to {next}")))
    }
}

fn invalid_state(op: &SyncOperation, detail: &str) -> MergeError {
    MergeError::InvalidOperationState {
        operation_id: op.id.clone(),
        status: op.status.to_string(),
        detail: detail.to_string(),
    }
}

fn count(conflicts: &[Conflict], status: ResolutionStatus) -> usize {
    conflicts
        .iter()
        .filter(|c| c.resolution_status == status)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictResolver, ResolutionStrategy};
    use crate::models::{EntityType, ScenarioType};
    use crate::scenario::{NewScenario, ScenarioGraph};
    use crate::store::{EntityEdit, EntityFields, EntityKey, EntityStore};
    use serde_json::{json, Value};

    struct Fixture {
        graph: ScenarioGraph,
        store: EntityStore,
        merges: MergeCoordinator,
        resolver: ConflictResolver,
        baseline: Scenario,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let graph = ScenarioGraph::new(Arc::clone(&db), 16, "main");
        let store = EntityStore::new(Arc::clone(&db), 16);
        let baseline = graph.create(NewScenario::root("Baseline", "alice")).unwrap();
        store
            .apply_batch(
                &baseline.id,
                &[upsert("a1", json!({"allocation_percentage": 50, "notes": "initial"}))],
                "alice",
                "seed",
            )
            .unwrap();
        Fixture {
            merges: MergeCoordinator::new(Arc::clone(&db), 900, 16),
            resolver: ConflictResolver::new(Arc::clone(&db)),
            graph,
            store,
            baseline,
        }
    }

    fn upsert(id: &str, value: Value) -> EntityEdit {
        EntityEdit::Upsert {
            entity_type: EntityType::Assignment,
            entity_id: id.into(),
            fields: serde_json::from_value::<EntityFields>(value).unwrap(),
        }
    }

    fn patch(id: &str, value: Value) -> EntityEdit {
        EntityEdit::Patch {
            entity_type: EntityType::Assignment,
            entity_id: id.into(),
            fields: serde_json::from_value::<EntityFields>(value).unwrap(),
        }
    }

    fn allocation(f: &Fixture, scenario_id: &str) -> Value {
        let snapshot = f.store.snapshot(scenario_id).unwrap();
        snapshot
            .get(&EntityKey::new(EntityType::Assignment, "a1"))
            .unwrap()["allocation_percentage"]
            .clone()
    }

    fn branch(f: &Fixture, name: &str) -> Scenario {
        f.graph
            .create(NewScenario::branch(&f.baseline.id, ScenarioType::WhatIf, name, "bob"))
            .unwrap()
    }

    #[test]
    fn test_clean_merge_commits_and_archives_child() {
        let f = fixture();
        let child = branch(&f, "Hire plan");
        f.store
            .apply_batch(
                &child.id,
                &[patch("a1", json!({"allocation_percentage": 80}))],
                "bob",
                "edit",
            )
            .unwrap();

        let outcome = f.merges.merge(&child.id, "bob").unwrap();
        assert!(outcome.is_committed());
        assert!(outcome.conflicts.is_empty());
        let history = outcome.history.unwrap();
        assert_eq!(history.scenario_id, f.baseline.id);
        assert_eq!(history.sync_operation_id.as_deref(), Some(outcome.operation.id.as_str()));

        assert_eq!(allocation(&f, &f.baseline.id), json!(80));
        let child = f.graph.get(&child.id).unwrap();
        assert_eq!(child.status, ScenarioStatus::Archived);
        assert_eq!(f.graph.branch(&child.id).unwrap().merge_status, MergeStatus::Merged);
    }

    #[test]
    fn test_conflict_halts_then_retry_commits() {
        let f = fixture();
        let child = branch(&f, "Optimistic");
        f.store
            .apply_batch(
                &child.id,
                &[patch("a1", json!({"allocation_percentage": 60}))],
                "bob",
                "edit",
            )
            .unwrap();
        f.store
            .apply_batch(
                &f.baseline.id,
                &[patch("a1", json!({"allocation_percentage": 70}))],
                "alice",
                "edit",
            )
            .unwrap();

        let outcome = f.merges.merge(&child.id, "bob").unwrap();
        assert_eq!(outcome.operation.status, SyncOperationStatus::Conflict);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(allocation(&f, &f.baseline.id), json!(70));

        let op_id = outcome.operation.id.clone();
        let err = f.merges.retry(&op_id, "bob").unwrap_err();
        assert!(matches!(err, MergeError::ConflictPending { pending: 1, .. }));

        f.resolver
            .resolve(&outcome.conflicts[0].id, ResolutionStrategy::AcceptLocal, "bob")
            .unwrap();
        let outcome = f.merges.retry(&op_id, "bob").unwrap();
        assert!(outcome.is_committed());
        assert_eq!(allocation(&f, &f.baseline.id), json!(60));
        assert_eq!(f.merges.operation(&op_id).unwrap().conflict_count, 1);
    }

    #[test]
    fn test_abandon_leaves_parent_untouched() {
        let f = fixture();
        let child = branch(&f, "Pessimistic");
        f.store
            .apply_batch(
                &child.id,
                &[patch("a1", json!({"allocation_percentage": 10}))],
                "bob",
                "edit",
            )
            .unwrap();
        f.store
            .apply_batch(
                &f.baseline.id,
                &[patch("a1", json!({"allocation_percentage": 20}))],
                "alice",
                "edit",
            )
            .unwrap();

        let outcome = f.merges.merge(&child.id, "bob").unwrap();
        let op = f.merges.abandon(&outcome.operation.id, "bob").unwrap();
        assert_eq!(op.status, SyncOperationStatus::Failed);
        assert_eq!(op.error_message.as_deref(), Some("abandoned by bob"));
        assert_eq!(allocation(&f, &f.baseline.id), json!(20));
        assert_eq!(f.graph.get(&child.id).unwrap().status, ScenarioStatus::Draft);

        assert!(matches!(
            f.merges.retry(&op.id, "bob").unwrap_err(),
            MergeError::InvalidOperationState { .. }
        ));
    }

    #[test]
    fn test_second_merge_refused_while_first_is_halted() {
        let f = fixture();
        let child = branch(&f, "Optimistic");
        f.store
            .apply_batch(
                &child.id,
                &[patch("a1", json!({"allocation_percentage": 60}))],
                "bob",
                "edit",
            )
            .unwrap();
        f.store
            .apply_batch(
                &f.baseline.id,
                &[patch("a1", json!({"allocation_percentage": 70}))],
                "alice",
                "edit",
            )
            .unwrap();

        let first = f.merges.merge(&child.id, "bob").unwrap();
        assert_eq!(first.operation.status, SyncOperationStatus::Conflict);

        let err = f.merges.merge(&child.id, "carol").unwrap_err();
        assert!(matches!(
            err,
            MergeError::InvalidOperationState { ref operation_id, .. }
                if *operation_id == first.operation.id
        ));
        assert_eq!(f.resolver.outstanding_for_scenario(&child.id).unwrap().len(), 1);

        f.merges.abandon(&first.operation.id, "bob").unwrap();
        let second = f.merges.merge(&child.id, "carol").unwrap();
        assert_eq!(second.operation.status, SyncOperationStatus::Conflict);
        assert_eq!(f.resolver.outstanding_for_scenario(&child.id).unwrap().len(), 1);
    }

    #[test]
    fn test_merge_rejections() {
        let f = fixture();
        assert!(matches!(
            f.merges.merge(&f.baseline.id, "bob").unwrap_err(),
            MergeError::ScenarioError(ScenarioError::Validation(_))
        ));

        let child = branch(&f, "Parent");
        f.graph
            .create(NewScenario::branch(&child.id, ScenarioType::Custom, "Grandchild", "bob"))
            .unwrap();
        assert!(matches!(
            f.merges.merge(&child.id, "bob").unwrap_err(),
            MergeError::ScenarioError(ScenarioError::HasActiveChildren { count: 1, .. })
        ));
        assert!(matches!(
            f.merges.operation("nope").unwrap_err(),
            MergeError::OperationNotFound(_)
        ));
    }
}
