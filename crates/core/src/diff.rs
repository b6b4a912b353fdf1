//! Field-level diff between two scenario snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{queries, Database};
use crate::errors::ScenarioError;
use crate::models::{DiffSummary, EntityType};
use crate::store::{load_snapshot, values_equal, EntityFields, EntityKey, Snapshot};

/// Per-entity outcome of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    Unchanged,
}

impl ChangeKind {
    fn reversed(self) -> Self {
        match self {
            Self::Added => Self::Removed,
            Self::Removed => Self::Added,
            other => other,
        }
    }
}

/// `from -> to` values of one field; `null` stands for "absent".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub from_value: Value,
    pub to_value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDiff {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub change: ChangeKind,
    /// Every field for added/removed rows, the differing fields for
    /// modified rows, empty for unchanged ones.
    pub fields: BTreeMap<String, FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub from_scenario_id: String,
    pub to_scenario_id: String,
    pub entries: Vec<EntityDiff>,
}

impl Diff {
    /// The diff of `to -> from`.
    pub fn reversed(&self) -> Diff {
        Diff {
            from_scenario_id: self.to_scenario_id.clone(),
            to_scenario_id: self.from_scenario_id.clone(),
            entries: self
                .entries
                .iter()
                .map(|entry| EntityDiff {
                    entity_type: entry.entity_type,
                    entity_id: entry.entity_id.clone(),
                    change: entry.change.reversed(),
                    fields: entry
                        .fields
                        .iter()
                        .map(|(name, change)| {
                            (
                                name.clone(),
                                FieldChange {
                                    from_value: change.to_value.clone(),
                                    to_value: change.from_value.clone(),
                                },
                            )
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Entries that are not `unchanged`.
    pub fn changed(&self) -> impl Iterator<Item = &EntityDiff> {
        self.entries
            .iter()
            .filter(|entry| entry.change != ChangeKind::Unchanged)
    }

    /// Counts of field values introduced and dropped.
    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();
        for change in self.changed().flat_map(|entry| entry.fields.values()) {
            if !change.to_value.is_null() {
                summary.added += 1;
            }
            if !change.from_value.is_null() {
                summary.removed += 1;
            }
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.changed().next().is_none()
    }
}

/// Compare two snapshots. Pure; entries are ordered by entity key.
pub fn diff_snapshots(from_id: &str, to_id: &str, from: &Snapshot, to: &Snapshot) -> Diff {
    let keys: BTreeSet<&EntityKey> = from.keys().chain(to.keys()).collect();
    let entries = keys
        .into_iter()
        .map(|key| {
            let (change, fields) = match (from.get(key), to.get(key)) {
                (None, Some(row)) => (ChangeKind::Added, all_fields(row, false)),
                (Some(row), None) => (ChangeKind::Removed, all_fields(row, true)),
                (Some(a), Some(b)) => {
                    let fields = changed_fields(a, b);
                    if fields.is_empty() {
                        (ChangeKind::Unchanged, fields)
                    } else {
                        (ChangeKind::Modified, fields)
                    }
                }
                (None, None) => (ChangeKind::Unchanged, BTreeMap::new()),
            };
            EntityDiff {
                entity_type: key.entity_type,
                entity_id: key.entity_id.clone(),
                change,
                fields,
            }
        })
        .collect();

    Diff {
        from_scenario_id: from_id.to_string(),
        to_scenario_id: to_id.to_string(),
        entries,
    }
}

fn all_fields(row: &EntityFields, removed: bool) -> BTreeMap<String, FieldChange> {
    row.iter()
        .map(|(name, value)| {
            let change = if removed {
                FieldChange {
                    from_value: value.clone(),
                    to_value: Value::Null,
                }
            } else {
                FieldChange {
                    from_value: Value::Null,
                    to_value: value.clone(),
                }
            };
            (name.clone(), change)
        })
        .collect()
}

fn changed_fields(a: &EntityFields, b: &EntityFields) -> BTreeMap<String, FieldChange> {
    let names: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let from = a.get(name).cloned().unwrap_or(Value::Null);
            let to = b.get(name).cloned().unwrap_or(Value::Null);
            (!values_equal(&from, &to)).then(|| {
                (
                    name.clone(),
                    FieldChange {
                        from_value: from,
                        to_value: to,
                    },
                )
            })
        })
        .collect()
}

/// Read-only comparison service. Takes no locks.
pub struct DiffEngine {
    db: Arc<Database>,
    max_depth: usize,
}

impl DiffEngine {
    pub fn new(db: Arc<Database>, max_depth: usize) -> Self {
        Self { db, max_depth }
    }

    /// Compare the effective states of two scenarios.
    pub fn compare(&self, from_id: &str, to_id: &str) -> Result<Diff, ScenarioError> {
        let (from, to) = self.db.read(|conn| {
            let from = load_snapshot(conn, from_id, None, self.max_depth)?;
            let to = load_snapshot(conn, to_id, None, self.max_depth)?;
            Ok::<_, ScenarioError>((from, to))
        })?;
        Ok(diff_snapshots(from_id, to_id, &from, &to))
    }

    /// Compare a scenario's current state against its parent at branch time.
    pub fn compare_to_base(&self, scenario_id: &str) -> Result<Diff, ScenarioError> {
        let (parent_id, base, current) = self.db.read(|conn| {
            let scenario = queries::get_scenario(conn, scenario_id)?
                .ok_or_else(|| ScenarioError::NotFound(scenario_id.to_string()))?;
            let parent_id = scenario.parent_scenario_id.clone().ok_or_else(|| {
                ScenarioError::Validation(format!(
                    "scenario '{scenario_id}' is a root and has no base to compare to"
                ))
            })?;
            let base = load_snapshot(
                conn,
                &parent_id,
                Some(scenario.branched_at_revision),
                self.max_depth,
            )?;
            let current = load_snapshot(conn, scenario_id, None, self.max_depth)?;
            Ok::<_, ScenarioError>((parent_id, base, current))
        })?;
        Ok(diff_snapshots(&parent_id, scenario_id, &base, &current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn snapshot(rows: Vec<(EntityType, &str, Value)>) -> Snapshot {
        rows.into_iter()
            .map(|(t, id, v)| {
                (
                    EntityKey::new(t, id),
                    serde_json::from_value::<EntityFields>(v).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_diff_kinds_and_fields() {
        let a = snapshot(vec![
            (EntityType::Project, "p1", json!({"name": "Apollo", "budget": 10})),
            (EntityType::Project, "p2", json!({"name": "Gemini"})),
            (EntityType::Person, "u1", json!({"name": "Ada"})),
        ]);
        let b = snapshot(vec![
            (EntityType::Project, "p1", json!({"name": "Apollo", "budget": 12})),
            (EntityType::Person, "u1", json!({"name": "Ada"})),
            (EntityType::Assignment, "a1", json!({"allocation_percentage": 50})),
        ]);
        let diff = diff_snapshots("a", "b", &a, &b);

        let kind = |id: &str| {
            diff.entries
                .iter()
                .find(|e| e.entity_id == id)
                .map(|e| e.change)
                .unwrap()
        };
        assert_eq!(kind("p1"), ChangeKind::Modified);
        assert_eq!(kind("p2"), ChangeKind::Removed);
        assert_eq!(kind("u1"), ChangeKind::Unchanged);
        assert_eq!(kind("a1"), ChangeKind::Added);

        let p1 = diff.entries.iter().find(|e| e.entity_id == "p1").unwrap();
        assert_eq!(p1.fields.len(), 1);
        assert_eq!(p1.fields["budget"].from_value, json!(10));
        assert_eq!(p1.fields["budget"].to_value, json!(12));

        // budget 10 -> 12 (1 removed, 1 added), p2 name removed, a1 allocation added
        assert_eq!(diff.summary(), DiffSummary { added: 2, removed: 2 });
        assert_eq!(diff.changed().count(), 3);
    }

    #[test]
    fn test_numeric_equality_is_exact() {
        let a = snapshot(vec![(EntityType::Assignment, "a1", json!({"allocation_percentage": 50}))]);
        let same = snapshot(vec![(EntityType::Assignment, "a1", json!({"allocation_percentage": 50.0}))]);
        let near = snapshot(vec![(
            EntityType::Assignment,
            "a1",
            json!({"allocation_percentage": 50.0001}),
        )]);
        assert!(diff_snapshots("a", "b", &a, &same).is_empty());
        assert!(!diff_snapshots("a", "b", &a, &near).is_empty());
    }

    fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
        let row = prop::collection::btree_map("[a-c]", 0i64..3, 0..3);
        prop::collection::btree_map(("[pq]", 0usize..2), row, 0..5).prop_map(|rows| {
            rows.into_iter()
                .map(|((id, t), fields)| {
                    let entity_type = if t == 0 {
                        EntityType::Project
                    } else {
                        EntityType::Person
                    };
                    let fields: EntityFields =
                        fields.into_iter().map(|(k, v)| (k, json!(v))).collect();
                    (EntityKey::new(entity_type, id), fields)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_reverse_diff_equals_swapped_compare(a in arb_snapshot(), b in arb_snapshot()) {
            let forward = diff_snapshots("a", "b", &a, &b);
            let backward = diff_snapshots("b", "a", &b, &a);
            prop_assert_eq!(forward.reversed(), backward);
        }

        #[test]
        fn prop_self_diff_is_empty(a in arb_snapshot()) {
            prop_assert!(diff_snapshots("a", "a", &a, &a).is_empty());
        }
    }
}
