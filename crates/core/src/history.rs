//! Append-only change history.
//!
//! Every committed change-set (edit batch, merge, pull, push, import) leaves
//! one [`ChangeHistoryEntry`] together with the entities it touched, so the
//! history of a single entity can be read back across merges.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::db::{queries, Database};
use crate::diff::{ChangeKind, Diff};
use crate::errors::{DatabaseError, ScenarioError};
use crate::models::{ChangeHistoryEntry, EntityAction, EntityRef, EntityType, Page};

/// Largest page a query may ask for.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Build the history entry describing a written diff.
///
/// Without a git `commit_sha` a deterministic SHA-256 over the entry's
/// content is used instead.
pub fn entry_for_diff(
    scenario_id: &str,
    sync_operation_id: Option<&str>,
    author: &str,
    message: &str,
    diff: &Diff,
    commit_sha: Option<String>,
    now: DateTime<Utc>,
) -> ChangeHistoryEntry {
    let mut files = BTreeSet::new();
    let entities_affected: Vec<EntityRef> = diff
        .changed()
        .map(|entry| {
            files.insert(entry.entity_type.collection().to_string());
            EntityRef {
                entity_type: entry.entity_type,
                entity_id: entry.entity_id.clone(),
                action: match entry.change {
                    ChangeKind::Added => EntityAction::Created,
                    ChangeKind::Removed => EntityAction::Deleted,
                    _ => EntityAction::Updated,
                },
            }
        })
        .collect();

    let mut entry = ChangeHistoryEntry {
        id: None,
        commit_sha: String::new(),
        scenario_id: scenario_id.to_string(),
        sync_operation_id: sync_operation_id.map(str::to_string),
        author: author.to_string(),
        author_name: author.to_string(),
        timestamp: now,
        message: message.to_string(),
        files_changed: files.into_iter().collect(),
        entities_affected,
        diff_summary: diff.summary(),
    };
    entry.commit_sha = commit_sha.unwrap_or_else(|| local_sha(&entry));
    entry
}

fn local_sha(entry: &ChangeHistoryEntry) -> String {
    let mut hasher = Sha256::new();
    for part in [
        entry.scenario_id.as_str(),
        entry.sync_operation_id.as_deref().unwrap_or(""),
        entry.author.as_str(),
        &queries::ts(&entry.timestamp),
        entry.message.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    for entity in &entry.entities_affected {
        hasher.update(entity.entity_type.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(entity.entity_id.as_bytes());
        hasher.update(b":");
        hasher.update(entity.action.as_str().as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Append `entry` on an open connection (or transaction).
pub fn record_in(
    conn: &Connection,
    mut entry: ChangeHistoryEntry,
) -> Result<ChangeHistoryEntry, DatabaseError> {
    let id = queries::insert_history(conn, &entry)?;
    entry.id = Some(id);
    debug!(
        history_id = id,
        scenario_id = %entry.scenario_id,
        commit_sha = %entry.commit_sha,
        "recorded change-set"
    );
    Ok(entry)
}

pub struct ChangeHistoryLog {
    db: Arc<Database>,
}

impl ChangeHistoryLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn record(&self, entry: ChangeHistoryEntry) -> Result<ChangeHistoryEntry, DatabaseError> {
        self.db.transaction(|conn| record_in(conn, entry))
    }

    /// Entries that touched one entity, newest first.
    pub fn query(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        max_count: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ChangeHistoryEntry>, ScenarioError> {
        let before = cursor.map(decode_cursor).transpose()?;
        let limit = clamp(max_count);
        let rows = self.db.read(|conn| {
            queries::history_for_entity(conn, entity_type, entity_id, before, limit + 1)
        })?;
        Ok(paginate(rows, limit))
    }

    /// Entries committed on one scenario, newest first.
    pub fn for_scenario(
        &self,
        scenario_id: &str,
        max_count: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ChangeHistoryEntry>, ScenarioError> {
        let before = cursor.map(decode_cursor).transpose()?;
        let limit = clamp(max_count);
        let rows = self
            .db
            .read(|conn| queries::history_for_scenario(conn, scenario_id, before, limit + 1))?;
        Ok(paginate(rows, limit))
    }
}

fn clamp(max_count: u32) -> u32 {
    max_count.clamp(1, MAX_PAGE_SIZE)
}

fn paginate(mut rows: Vec<ChangeHistoryEntry>, limit: u32) -> Page<ChangeHistoryEntry> {
    let limit = limit as usize;
    let next_cursor = if rows.len() > limit {
        rows.truncate(limit);
        rows.last().and_then(|e| e.id).map(encode_cursor)
    } else {
        None
    };
    Page {
        items: rows,
        next_cursor,
    }
}

fn encode_cursor(id: i64) -> String {
    hex::encode(id.to_string())
}

fn decode_cursor(cursor: &str) -> Result<i64, ScenarioError> {
    let invalid = || ScenarioError::Validation(format!("invalid history cursor '{cursor}'"));
    let bytes = hex::decode(cursor).map_err(|_| invalid())?;
    String::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff_snapshots;
    use crate::store::{EntityFields, EntityKey, Snapshot};
    use serde_json::json;

    fn snapshot(rows: Vec<(EntityType, &str, serde_json::Value)>) -> Snapshot {
        rows.into_iter()
            .map(|(t, id, v)| {
                let fields: EntityFields = serde_json::from_value(v).unwrap();
                (EntityKey::new(t, id), fields)
            })
            .collect()
    }

    fn scenario(db: &Database, id: &str) {
        db.conn()
            .execute(
                "INSERT INTO scenarios (id, name, scenario_type, status, parent_scenario_id,
                                        branched_at_revision, created_by, created_at, updated_at)
                 VALUES (?1, ?1, 'baseline', 'active', NULL, 0, 'test',
                         '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
                rusqlite::params![id],
            )
            .unwrap();
    }

    #[test]
    fn test_entry_for_diff_describes_changes() {
        let from = snapshot(vec![
            (EntityType::Project, "p1", json!({"name": "Apollo"})),
            (EntityType::Person, "u1", json!({"name": "Ada"})),
        ]);
        let to = snapshot(vec![
            (EntityType::Project, "p1", json!({"name": "Apollo II"})),
            (EntityType::Assignment, "a1", json!({"allocation_percentage": 50})),
        ]);
        let diff = diff_snapshots("s", "s", &from, &to);
        let now = Utc::now();
        let entry = entry_for_diff("s", None, "alice", "edit", &diff, None, now);

        assert_eq!(entry.files_changed, vec!["assignments", "people", "projects"]);
        let actions: Vec<_> = entry
            .entities_affected
            .iter()
            .map(|e| (e.entity_id.as_str(), e.action))
            .collect();
        assert!(actions.contains(&("a1", EntityAction::Created)));
        assert!(actions.contains(&("u1", EntityAction::Deleted)));
        assert!(actions.contains(&("p1", EntityAction::Updated)));
        assert_eq!(entry.diff_summary.added, 2);
        assert_eq!(entry.diff_summary.removed, 2);
        assert_eq!(entry.commit_sha.len(), 64);

        let again = entry_for_diff("s", None, "alice", "edit", &diff, None, now);
        assert_eq!(entry.commit_sha, again.commit_sha);
        let git = entry_for_diff("s", None, "alice", "edit", &diff, Some("abc".into()), now);
        assert_eq!(git.commit_sha, "abc");
    }

    #[test]
    fn test_query_pages_newest_first() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        scenario(&db, "s");
        let log = ChangeHistoryLog::new(Arc::clone(&db));

        let mut before = Snapshot::new();
        for pct in 1..=5 {
            let after = snapshot(vec![(
                EntityType::Assignment,
                "a1",
                json!({"allocation_percentage": pct}),
            )]);
            let diff = diff_snapshots("s", "s", &before, &after);
            let entry = entry_for_diff("s", None, "bob", &format!("set {pct}"), &diff, None, Utc::now());
            log.record(entry).unwrap();
            before = after;
        }

        let page = log.query(EntityType::Assignment, "a1", 2, None).unwrap();
        let messages: Vec<_> = page.items.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["set 5", "set 4"]);

        let cursor = page.next_cursor.unwrap();
        let page = log
            .query(EntityType::Assignment, "a1", 2, Some(&cursor))
            .unwrap();
        let messages: Vec<_> = page.items.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["set 3", "set 2"]);

        let page = log
            .query(EntityType::Assignment, "a1", 2, page.next_cursor.as_deref())
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_cursor.is_none());

        assert_eq!(log.for_scenario("s", 0, None).unwrap().items.len(), 1);
        assert!(matches!(
            log.query(EntityType::Assignment, "a1", 2, Some("zz")),
            Err(ScenarioError::Validation(_))
        ));
    }
}
