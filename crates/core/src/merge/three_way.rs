//! Field-level three-way merge of entity snapshots.
//!
//! Per entity, presence is decided first (added/deleted on either side);
//! rows present on both sides are then merged field by field.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Conflict, ResolutionStatus};
use crate::store::{
    normalize_fields, row_value, rows_equal, values_equal, EntityFields, EntityKey, Snapshot,
};

/// Pseudo-field used when the two sides disagree about whether an entity
/// exists at all (one edited it, the other deleted it). Values are whole rows,
/// `null` meaning "absent".
pub const ENTITY_FIELD: &str = "_entity";

/// One field where local and remote diverged from base differently.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConflict {
    pub key: EntityKey,
    pub entity_name: Option<String>,
    pub field: String,
    pub base: Value,
    pub local: Value,
    pub remote: Value,
}

impl FieldConflict {
    /// Whether a recorded conflict describes the same disagreement.
    pub fn matches(&self, recorded: &Conflict) -> bool {
        recorded.entity_type == self.key.entity_type
            && recorded.entity_id == self.key.entity_id
            && recorded.field == self.field
            && values_equal(&recorded.local_value, &self.local)
            && values_equal(&recorded.remote_value, &self.remote)
    }

    /// A new pending conflict record owned by `operation_id`.
    pub fn to_record(&self, operation_id: &str) -> Conflict {
        Conflict {
            id: Uuid::new_v4().to_string(),
            sync_operation_id: operation_id.to_string(),
            entity_type: self.key.entity_type,
            entity_id: self.key.entity_id.clone(),
            entity_name: self.entity_name.clone(),
            field: self.field.clone(),
            base_value: self.base.clone(),
            local_value: self.local.clone(),
            remote_value: self.remote.clone(),
            resolution_status: ResolutionStatus::Pending,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a three-way merge: the merged state (with conflicting fields
/// left at their base value) and the conflicts still to be decided.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub merged: Snapshot,
    pub conflicts: Vec<FieldConflict>,
}

impl MergePlan {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Write a chosen value for a conflict into the merged state.
    pub fn apply_resolution(&mut self, conflict: &FieldConflict, value: &Value) {
        if conflict.field == ENTITY_FIELD {
            match value {
                Value::Object(map) => {
                    let fields: EntityFields =
                        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    self.merged.insert(conflict.key.clone(), fields);
                }
                _ => {
                    self.merged.remove(&conflict.key);
                }
            }
            return;
        }

        let mut row = self.merged.get(&conflict.key).cloned().unwrap_or_default();
        row.insert(conflict.field.clone(), value.clone());
        self.merged.insert(conflict.key.clone(), row);
    }

    /// Settle every conflict that has a matching resolved record, leaving
    /// only the ones nobody has decided yet.
    pub fn apply_recorded(&mut self, recorded: &[Conflict]) {
        let conflicts = std::mem::take(&mut self.conflicts);
        for conflict in conflicts {
            let decision = recorded.iter().find(|r| {
                r.resolution_status == ResolutionStatus::Resolved && conflict.matches(r)
            });
            match decision.and_then(|r| r.resolved_value.as_ref()) {
                Some(value) => self.apply_resolution(&conflict, value),
                None => self.conflicts.push(conflict),
            }
        }
    }
}

/// Merge `local` and `remote`, both descended from `base`.
pub fn merge(base: &Snapshot, local: &Snapshot, remote: &Snapshot) -> MergePlan {
    let keys: BTreeSet<&EntityKey> = base
        .keys()
        .chain(local.keys())
        .chain(remote.keys())
        .collect();
    let mut plan = MergePlan::default();

    for key in keys {
        let (b, l, r) = (base.get(key), local.get(key), remote.get(key));

        // Whole-row fast paths.
        if rows_equal(l, r) {
            keep(&mut plan.merged, key, l);
            continue;
        }
        if rows_equal(l, b) {
            keep(&mut plan.merged, key, r);
            continue;
        }
        if rows_equal(r, b) {
            keep(&mut plan.merged, key, l);
            continue;
        }

        match (l, r) {
            (Some(l), Some(r)) => {
                let empty = EntityFields::new();
                let b = b.unwrap_or(&empty);
                let merged = merge_fields(&mut plan.conflicts, key, b, l, r);
                plan.merged.insert(key.clone(), merged);
            }
            _ => {
                debug!(entity_id = %key.entity_id, "edit versus delete conflict");
                plan.conflicts.push(FieldConflict {
                    key: key.clone(),
                    entity_name: entity_name(&[l, r, b]),
                    field: ENTITY_FIELD.to_string(),
                    base: row_value(b),
                    local: row_value(l),
                    remote: row_value(r),
                });
                keep(&mut plan.merged, key, b);
            }
        }
    }
    plan
}

fn keep(merged: &mut Snapshot, key: &EntityKey, row: Option<&EntityFields>) {
    if let Some(row) = row {
        merged.insert(key.clone(), row.clone());
    }
}

fn merge_fields(
    conflicts: &mut Vec<FieldConflict>,
    key: &EntityKey,
    base: &EntityFields,
    local: &EntityFields,
    remote: &EntityFields,
) -> EntityFields {
    let names: BTreeSet<&String> = base
        .keys()
        .chain(local.keys())
        .chain(remote.keys())
        .collect();
    let mut merged = EntityFields::new();

    for name in names {
        let b = base.get(name).unwrap_or(&Value::Null);
        let l = local.get(name).unwrap_or(&Value::Null);
        let r = remote.get(name).unwrap_or(&Value::Null);

        let value = if values_equal(l, r) || values_equal(r, b) {
            l
        } else if values_equal(l, b) {
            r
        } else {
            conflicts.push(FieldConflict {
                key: key.clone(),
                entity_name: entity_name(&[Some(local), Some(remote), Some(base)]),
                field: name.clone(),
                base: b.clone(),
                local: l.clone(),
                remote: r.clone(),
            });
            b
        };
        merged.insert(name.clone(), value.clone());
    }
    normalize_fields(merged)
}

/// Display name of an entity, taken from the first row with a `name`.
fn entity_name(rows: &[Option<&EntityFields>]) -> Option<String> {
    rows.iter()
        .flatten()
        .find_map(|row| row.get("name").and_then(Value::as_str))
        .map(str::to_string)
}
