//! `ScenarioExportData`: the persisted JSON form of a scenario.
//!
//! The same payload is what every git branch carries in `scenario.json`.
//! Decoding checks `schemaVersion` before anything else and refuses versions
//! it does not know.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::db::{queries, Database};
use crate::errors::{ExportError, ScenarioError};
use crate::history;
use crate::models::{ChangeHistoryEntry, EntityType};
use crate::store::{load_snapshot, write_snapshot, EntityFields, EntityKey, Snapshot};

/// The only schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioExportData {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub exported_by: String,
    pub scenario_id: String,
    pub data: ExportCollections,
}

/// Entity records by collection. Each record is an object with an `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCollections {
    #[serde(default)]
    pub projects: Vec<Value>,
    #[serde(default)]
    pub people: Vec<Value>,
    #[serde(default)]
    pub assignments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_phases: Option<Vec<Value>>,
    /// Carried for compatibility; not a tracked entity type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Value>>,
}

impl ExportCollections {
    fn records(&self, entity_type: EntityType) -> &[Value] {
        match entity_type {
            EntityType::Project => &self.projects,
            EntityType::Person => &self.people,
            EntityType::Assignment => &self.assignments,
            EntityType::ProjectPhase => self.project_phases.as_deref().unwrap_or(&[]),
        }
    }
}

impl ScenarioExportData {
    /// Export a snapshot. Records are ordered by id within each collection.
    pub fn from_snapshot(
        scenario_id: &str,
        snapshot: &Snapshot,
        exported_by: &str,
        exported_at: DateTime<Utc>,
    ) -> Self {
        let collection = |entity_type: EntityType| -> Vec<Value> {
            snapshot
                .of_type(entity_type)
                .map(|(id, fields)| {
                    let mut record = Map::new();
                    record.insert("id".to_string(), Value::String(id.to_string()));
                    for (name, value) in fields {
                        if name != "id" {
                            record.insert(name.clone(), value.clone());
                        }
                    }
                    Value::Object(record)
                })
                .collect()
        };
        let phases = collection(EntityType::ProjectPhase);

        Self {
            schema_version: SCHEMA_VERSION,
            exported_at,
            exported_by: exported_by.to_string(),
            scenario_id: scenario_id.to_string(),
            data: ExportCollections {
                projects: collection(EntityType::Project),
                people: collection(EntityType::Person),
                assignments: collection(EntityType::Assignment),
                project_phases: if phases.is_empty() { None } else { Some(phases) },
                roles: None,
                locations: None,
            },
        }
    }

    /// Rebuild the entity snapshot carried by this payload.
    pub fn to_snapshot(&self) -> Result<Snapshot, ExportError> {
        let mut snapshot = Snapshot::new();
        for entity_type in EntityType::ALL {
            for (index, record) in self.data.records(entity_type).iter().enumerate() {
                let invalid = |detail: &str| ExportError::InvalidRecord {
                    collection: entity_type.collection().to_string(),
                    index,
                    detail: detail.to_string(),
                };
                let object = record.as_object().ok_or_else(|| invalid("not an object"))?;
                let id = match object.get("id") {
                    Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => return Err(invalid("missing id")),
                };
                let fields: EntityFields = object
                    .iter()
                    .filter(|(name, _)| name.as_str() != "id")
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                snapshot.insert(EntityKey::new(entity_type, id), fields);
            }
        }
        Ok(snapshot)
    }

    pub fn encode(&self) -> Result<String, ExportError> {
        serde_json::to_string_pretty(self).map_err(|e| ExportError::ParseError(e.to_string()))
    }

    /// Parse a payload, failing closed on unknown schema versions.
    pub fn decode(payload: &str) -> Result<Self, ExportError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|e| ExportError::ParseError(e.to_string()))?;
        match value.get("schemaVersion") {
            Some(Value::Number(n)) if n.as_u64() == Some(u64::from(SCHEMA_VERSION)) => {}
            Some(other) => {
                return Err(ExportError::UnsupportedSchema {
                    found: other.to_string(),
                })
            }
            None => {
                return Err(ExportError::UnsupportedSchema {
                    found: "missing".into(),
                })
            }
        }
        serde_json::from_value(value).map_err(|e| ExportError::ParseError(e.to_string()))
    }
}

/// Export and import of whole scenarios.
pub struct ScenarioExporter {
    db: Arc<Database>,
    max_depth: usize,
}

impl ScenarioExporter {
    pub fn new(db: Arc<Database>, max_depth: usize) -> Self {
        Self { db, max_depth }
    }

    pub fn export(&self, scenario_id: &str, user: &str) -> Result<ScenarioExportData, ScenarioError> {
        let snapshot = self
            .db
            .read(|conn| load_snapshot(conn, scenario_id, None, self.max_depth))?;
        Ok(ScenarioExportData::from_snapshot(
            scenario_id,
            &snapshot,
            user,
            Utc::now(),
        ))
    }

    /// Replace the scenario's effective state with the payload's. Returns
    /// the history entry, or `None` when the payload matched already.
    pub fn import(
        &self,
        scenario_id: &str,
        data: &ScenarioExportData,
        user: &str,
    ) -> Result<Option<ChangeHistoryEntry>, ExportError> {
        if data.schema_version != SCHEMA_VERSION {
            return Err(ExportError::UnsupportedSchema {
                found: data.schema_version.to_string(),
            });
        }
        let target = data.to_snapshot()?;

        let entry = self.db.transaction(|conn| -> Result<_, ExportError> {
            let scenario = queries::get_scenario(conn, scenario_id)?
                .ok_or_else(|| ScenarioError::NotFound(scenario_id.to_string()))?;
            if scenario.is_archived() {
                return Err(ScenarioError::Archived(scenario.id).into());
            }
            let current = load_snapshot(conn, scenario_id, None, self.max_depth)?;
            let diff = write_snapshot(conn, scenario_id, &current, &target)?;
            if diff.is_empty() {
                return Ok(None);
            }
            let message = format!("Import scenario data exported by {}", data.exported_by);
            let entry = history::entry_for_diff(
                scenario_id,
                None,
                user,
                &message,
                &diff,
                None,
                Utc::now(),
            );
            Ok(Some(history::record_in(conn, entry)?))
        })?;

        info!(
            scenario_id,
            user,
            changed = entry.as_ref().map(|e| e.entities_affected.len()).unwrap_or(0),
            "imported scenario data"
        );
        Ok(entry)
    }
}
