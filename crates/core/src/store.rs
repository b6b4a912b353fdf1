//! Entity snapshot store.
//!
//! Tracked entities live in an append-only arena of versions keyed by
//! `(scenario_id, entity_type, entity_id)`. A scenario stores only the rows
//! it added, changed or deleted; everything else is inherited by walking the
//! parent chain. [`load_snapshot`] folds that chain into the effective state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::db::{queries, Database};
use crate::diff::{diff_snapshots, Diff};
use crate::errors::{DatabaseError, ScenarioError};
use crate::history;
use crate::models::{ChangeHistoryEntry, EntityType};
use crate::scenario::ancestor_chain;

/// Field map of one entity row. Null-valued fields are never stored.
pub type EntityFields = BTreeMap<String, Value>;

/// Identity of a tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

/// Effective entity state of a scenario at some point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entities: BTreeMap<EntityKey, EntityFields>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&EntityFields> {
        self.entities.get(key)
    }

    /// Insert (or replace) a row. Null-valued fields are dropped.
    pub fn insert(&mut self, key: EntityKey, fields: EntityFields) {
        self.entities.insert(key, normalize_fields(fields));
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityFields> {
        self.entities.remove(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &EntityFields)> {
        self.entities.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities.keys()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Rows of one entity type, ordered by id.
    pub fn of_type(&self, entity_type: EntityType) -> impl Iterator<Item = (&str, &EntityFields)> {
        self.entities
            .iter()
            .filter(move |(key, _)| key.entity_type == entity_type)
            .map(|(key, fields)| (key.entity_id.as_str(), fields))
    }

    /// Whether both snapshots hold the same rows under value equality.
    pub fn equivalent(&self, other: &Snapshot) -> bool {
        let keys: BTreeSet<&EntityKey> = self.keys().chain(other.keys()).collect();
        keys.into_iter().all(|key| match (self.get(key), other.get(key)) {
            (Some(a), Some(b)) => fields_equal(a, b),
            (None, None) => true,
            _ => false,
        })
    }
}

impl FromIterator<(EntityKey, EntityFields)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (EntityKey, EntityFields)>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for (key, fields) in iter {
            snapshot.insert(key, fields);
        }
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Value equality
// ---------------------------------------------------------------------------

/// Drop null-valued fields; a null field and a missing field are the same.
pub fn normalize_fields(fields: EntityFields) -> EntityFields {
    fields.into_iter().filter(|(_, v)| !v.is_null()).collect()
}

/// Semantic equality of two JSON values: numbers compare by numeric value
/// (`50 == 50.0`), objects treat null members as absent.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => x == y,
            },
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            let keys: BTreeSet<&String> = xs.keys().chain(ys.keys()).collect();
            keys.into_iter().all(|k| {
                values_equal(
                    xs.get(k).unwrap_or(&Value::Null),
                    ys.get(k).unwrap_or(&Value::Null),
                )
            })
        }
        _ => a == b,
    }
}

/// Field-wise equality of two rows (null and missing are equivalent).
pub fn fields_equal(a: &EntityFields, b: &EntityFields) -> bool {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter().all(|k| {
        values_equal(
            a.get(k).unwrap_or(&Value::Null),
            b.get(k).unwrap_or(&Value::Null),
        )
    })
}

/// Equality of an optional row, where `None` means "entity absent".
pub fn rows_equal(a: Option<&EntityFields>, b: Option<&EntityFields>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => fields_equal(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// A whole row as a JSON value (`null` when absent).
pub fn row_value(row: Option<&EntityFields>) -> Value {
    match row {
        Some(fields) => Value::Object(fields.clone().into_iter().collect()),
        None => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Fold the ancestor chain root -> `scenario_id` into its effective state,
/// using only versions with `revision <= up_to` when a cutoff is given.
pub fn load_snapshot(
    conn: &Connection,
    scenario_id: &str,
    up_to: Option<i64>,
    max_depth: usize,
) -> Result<Snapshot, ScenarioError> {
    let chain = ancestor_chain(conn, scenario_id, max_depth)?;
    let cutoff = up_to.unwrap_or(i64::MAX);
    let mut snapshot = Snapshot::new();

    for scenario in chain.iter().rev() {
        for version in queries::latest_versions(conn, &scenario.id, cutoff)? {
            let key = EntityKey::new(version.entity_type, version.entity_id);
            match version.data {
                Some(data) => {
                    let fields: EntityFields =
                        serde_json::from_str(&data).map_err(DatabaseError::from)?;
                    snapshot.insert(key, fields);
                }
                None => {
                    snapshot.remove(&key);
                }
            }
        }
    }
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// One change in an edit batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EntityEdit {
    /// Create or fully replace a row.
    #[serde(rename_all = "camelCase")]
    Upsert {
        entity_type: EntityType,
        entity_id: String,
        fields: EntityFields,
    },
    /// Change some fields of an existing row; a null value removes the field.
    #[serde(rename_all = "camelCase")]
    Patch {
        entity_type: EntityType,
        entity_id: String,
        fields: EntityFields,
    },
    /// Delete a row (writes a tombstone).
    #[serde(rename_all = "camelCase")]
    Delete {
        entity_type: EntityType,
        entity_id: String,
    },
}

/// Apply `edits` on top of `current`, returning the target state.
pub fn apply_edits(current: &Snapshot, edits: &[EntityEdit]) -> Result<Snapshot, ScenarioError> {
    let mut target = current.clone();
    for edit in edits {
        match edit {
            EntityEdit::Upsert {
                entity_type,
                entity_id,
                fields,
            } => {
                check_entity_id(entity_id)?;
                target.insert(EntityKey::new(*entity_type, entity_id.clone()), fields.clone());
            }
            EntityEdit::Patch {
                entity_type,
                entity_id,
                fields,
            } => {
                let key = EntityKey::new(*entity_type, entity_id.clone());
                let mut row = target.get(&key).cloned().ok_or_else(|| {
                    ScenarioError::Validation(format!(
                        "cannot patch missing {entity_type} '{entity_id}'"
                    ))
                })?;
                for (field, value) in fields {
                    row.insert(field.clone(), value.clone());
                }
                target.insert(key, row);
            }
            EntityEdit::Delete {
                entity_type,
                entity_id,
            } => {
                let key = EntityKey::new(*entity_type, entity_id.clone());
                if target.remove(&key).is_none() {
                    return Err(ScenarioError::Validation(format!(
                        "cannot delete missing {entity_type} '{entity_id}'"
                    )));
                }
            }
        }
    }
    Ok(target)
}

fn check_entity_id(entity_id: &str) -> Result<(), ScenarioError> {
    if entity_id.trim().is_empty() {
        return Err(ScenarioError::Validation("entity id must not be empty".into()));
    }
    Ok(())
}

/// Append the minimal set of versions to `scenario_id` that turns `current`
/// into `target`, and return the diff that was written.
pub fn write_snapshot(
    conn: &Connection,
    scenario_id: &str,
    current: &Snapshot,
    target: &Snapshot,
) -> Result<Diff, DatabaseError> {
    let diff = diff_snapshots(scenario_id, scenario_id, current, target);
    let now = Utc::now();
    for entry in diff.changed() {
        let key = EntityKey::new(entry.entity_type, entry.entity_id.clone());
        let data = target.get(&key).map(serde_json::to_string).transpose()?;
        queries::insert_entity_version(
            conn,
            scenario_id,
            entry.entity_type,
            &entry.entity_id,
            data.as_deref(),
            &now,
        )?;
    }
    debug!(scenario_id, changed = diff.changed().count(), "wrote snapshot overlay");
    Ok(diff)
}

// ---------------------------------------------------------------------------
// Store service
// ---------------------------------------------------------------------------

/// Read/write access to tracked entities as they exist inside a scenario.
pub struct EntityStore {
    db: Arc<Database>,
    max_depth: usize,
}

impl EntityStore {
    pub fn new(db: Arc<Database>, max_depth: usize) -> Self {
        Self { db, max_depth }
    }

    /// Current effective state of a scenario.
    pub fn snapshot(&self, scenario_id: &str) -> Result<Snapshot, ScenarioError> {
        self.db
            .read(|conn| load_snapshot(conn, scenario_id, None, self.max_depth))
    }

    /// Effective state of a scenario as of arena revision `revision`.
    pub fn snapshot_at(&self, scenario_id: &str, revision: i64) -> Result<Snapshot, ScenarioError> {
        self.db
            .read(|conn| load_snapshot(conn, scenario_id, Some(revision), self.max_depth))
    }

    /// Commit an edit batch as one change-set. Returns `None` when the batch
    /// changed nothing.
    pub fn apply_batch(
        &self,
        scenario_id: &str,
        edits: &[EntityEdit],
        author: &str,
        message: &str,
    ) -> Result<Option<ChangeHistoryEntry>, ScenarioError> {
        self.db.transaction(|conn| {
            let scenario = queries::get_scenario(conn, scenario_id)?
                .ok_or_else(|| ScenarioError::NotFound(scenario_id.to_string()))?;
            if scenario.is_archived() {
                return Err(ScenarioError::Archived(scenario.id));
            }

            let current = load_snapshot(conn, scenario_id, None, self.max_depth)?;
            let target = apply_edits(&current, edits)?;
            let diff = write_snapshot(conn, scenario_id, &current, &target)?;
            if diff.changed().next().is_none() {
                debug!(scenario_id, "edit batch was a no-op");
                return Ok(None);
            }

            let entry = history::entry_for_diff(
                scenario_id,
                None,
                author,
                message,
                &diff,
                None,
                Utc::now(),
            );
            let entry = history::record_in(conn, entry)?;
            info!(
                scenario_id,
                commit_sha = %entry.commit_sha,
                entities = entry.entities_affected.len(),
                "committed edit batch"
            );
            Ok(Some(entry))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScenarioType;
    use crate::scenario::{NewScenario, ScenarioGraph};
    use serde_json::json;

    fn fields(value: Value) -> EntityFields {
        serde_json::from_value(value).unwrap()
    }

    fn setup() -> (Arc<Database>, ScenarioGraph, EntityStore) {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let graph = ScenarioGraph::new(Arc::clone(&db), 16, "main");
        let store = EntityStore::new(Arc::clone(&db), 16);
        (db, graph, store)
    }

    fn upsert(entity_type: EntityType, id: &str, value: Value) -> EntityEdit {
        EntityEdit::Upsert {
            entity_type,
            entity_id: id.into(),
            fields: fields(value),
        }
    }

    #[test]
    fn test_values_equal_numbers_and_nulls() {
        assert!(values_equal(&json!(50), &json!(50.0)));
        assert!(!values_equal(&json!(50), &json!(50.0001)));
        assert!(values_equal(&json!({"a": 1, "b": null}), &json!({"a": 1.0})));
        assert!(!values_equal(&json!("50"), &json!(50)));
        assert!(fields_equal(
            &fields(json!({"x": null, "y": 2})),
            &fields(json!({"y": 2}))
        ));
    }

    #[test]
    fn test_child_inherits_and_overrides_parent() {
        let (_db, graph, store) = setup();
        let base = graph
            .create(NewScenario::root("Baseline", "alice"))
            .unwrap();
        store
            .apply_batch(
                &base.id,
                &[
                    upsert(EntityType::Project, "p1", json!({"name": "Apollo"})),
                    upsert(EntityType::Project, "p2", json!({"name": "Gemini"})),
                ],
                "alice",
                "seed",
            )
            .unwrap();

        let child = graph
            .create(NewScenario::branch(&base.id, ScenarioType::WhatIf, "Hire more", "bob"))
            .unwrap();
        store
            .apply_batch(
                &child.id,
                &[
                    EntityEdit::Patch {
                        entity_type: EntityType::Project,
                        entity_id: "p1".into(),
                        fields: fields(json!({"budget": 10})),
                    },
                    EntityEdit::Delete {
                        entity_type: EntityType::Project,
                        entity_id: "p2".into(),
                    },
                ],
                "bob",
                "tweak",
            )
            .unwrap();

        let child_view = store.snapshot(&child.id).unwrap();
        let p1 = child_view
            .get(&EntityKey::new(EntityType::Project, "p1"))
            .unwrap();
        assert_eq!(p1.get("budget"), Some(&json!(10)));
        assert!(!child_view.contains(&EntityKey::new(EntityType::Project, "p2")));

        let parent_view = store.snapshot(&base.id).unwrap();
        assert_eq!(parent_view.len(), 2);
        assert!(parent_view
            .get(&EntityKey::new(EntityType::Project, "p1"))
            .unwrap()
            .get("budget")
            .is_none());
    }

    #[test]
    fn test_snapshot_at_revision_ignores_later_versions() {
        let (_db, graph, store) = setup();
        let base = graph.create(NewScenario::root("Baseline", "alice")).unwrap();
        store
            .apply_batch(
                &base.id,
                &[upsert(EntityType::Person, "u1", json!({"name": "Ada", "fte": 1.0}))],
                "alice",
                "seed",
            )
            .unwrap();
        let child = graph
            .create(NewScenario::branch(&base.id, ScenarioType::Forecast, "Q3", "alice"))
            .unwrap();
        store
            .apply_batch(
                &base.id,
                &[EntityEdit::Patch {
                    entity_type: EntityType::Person,
                    entity_id: "u1".into(),
                    fields: fields(json!({"fte": 0.5})),
                }],
                "alice",
                "reduce",
            )
            .unwrap();

        let at_branch = store
            .snapshot_at(&base.id, child.branched_at_revision)
            .unwrap();
        let key = EntityKey::new(EntityType::Person, "u1");
        assert_eq!(at_branch.get(&key).unwrap().get("fte"), Some(&json!(1.0)));
        assert_eq!(
            store.snapshot(&base.id).unwrap().get(&key).unwrap().get("fte"),
            Some(&json!(0.5))
        );
    }

    #[test]
    fn test_apply_batch_rejects_archived_and_noop() {
        let (_db, graph, store) = setup();
        let base = graph.create(NewScenario::root("Baseline", "alice")).unwrap();
        let edit = upsert(EntityType::Project, "p1", json!({"name": "Apollo"}));
        assert!(store
            .apply_batch(&base.id, &[edit.clone()], "alice", "seed")
            .unwrap()
            .is_some());
        assert!(store
            .apply_batch(&base.id, &[edit.clone()], "alice", "again")
            .unwrap()
            .is_none());

        let child = graph
            .create(NewScenario::branch(&base.id, ScenarioType::Custom, "tmp", "alice"))
            .unwrap();
        graph.archive(&child.id).unwrap();
        let err = store
            .apply_batch(&child.id, &[edit], "alice", "late")
            .unwrap_err();
        assert!(matches!(err, ScenarioError::Archived(_)));
    }

    #[test]
    fn test_patch_missing_entity_is_rejected() {
        let current = Snapshot::new();
        let err = apply_edits(
            &current,
            &[EntityEdit::Patch {
                entity_type: EntityType::Assignment,
                entity_id: "a1".into(),
                fields: fields(json!({"notes": "x"})),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Validation(_)));
    }

    #[test]
    fn test_edit_deserializes_from_json() {
        let edit: EntityEdit = serde_json::from_value(json!({
            "op": "patch",
            "entityType": "assignment",
            "entityId": "a1",
            "fields": {"notes": "hello"}
        }))
        .unwrap();
        assert!(matches!(edit, EntityEdit::Patch { .. }));
        assert!(serde_json::from_value::<EntityEdit>(json!({
            "op": "delete",
            "entityType": "invoice",
            "entityId": "i1"
        }))
        .is_err());
    }
}
