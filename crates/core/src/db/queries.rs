//! Typed query helpers for every table in the ScenarioSync database.
//!
//! All helpers take a `&Connection` so callers can run them either on the
//! shared handle (`db.read(|conn| ..)`) or inside an open transaction.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::{
    BranchMetadata, ChangeHistoryEntry, Conflict, DiffSummary, EntityRef, EntityType,
    GitCredential, MergeStatus, Scenario, ScenarioStatus, SyncOperation,
};

// ---------------------------------------------------------------------------
// Row structs that have no domain model of their own
// ---------------------------------------------------------------------------

/// A row from `entity_versions`. `data == None` is a tombstone.
#[derive(Debug, Clone)]
pub struct EntityVersionRow {
    pub revision: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub data: Option<String>,
}

/// A row from `scenario_locks`.
#[derive(Debug, Clone)]
pub struct LockRow {
    pub lock_key: String,
    pub operation_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// A row from `sync_bases`: the last state both sides agreed on.
#[derive(Debug, Clone)]
pub struct SyncBaseRow {
    pub scenario_id: String,
    pub branch_name: String,
    pub commit_sha: String,
    pub snapshot: String,
    pub synced_at: DateTime<Utc>,
}

/// Fetched remote state parked on a conflicted pull.
#[derive(Debug, Clone)]
pub struct ParkedPayload {
    pub payload: String,
    pub commit_sha: String,
    /// `sync_bases.commit_sha` the conflicts were computed against.
    pub base_sha: Option<String>,
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// Canonical timestamp encoding: RFC 3339, UTC, microseconds. Sorts
/// lexicographically in time order.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = DatabaseError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

// ---------------------------------------------------------------------------
// scenarios
// ---------------------------------------------------------------------------

const SCENARIO_COLUMNS: &str = "id, name, scenario_type, status, parent_scenario_id, \
     branched_at_revision, created_by, created_at, updated_at";

fn scenario_from_row(row: &Row<'_>) -> rusqlite::Result<Scenario> {
    Ok(Scenario {
        id: row.get(0)?,
        name: row.get(1)?,
        scenario_type: enum_col(row, 2)?,
        status: enum_col(row, 3)?,
        parent_scenario_id: row.get(4)?,
        branched_at_revision: row.get(5)?,
        created_by: row.get(6)?,
        created_at: ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
    })
}

pub fn insert_scenario(conn: &Connection, scenario: &Scenario) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO scenarios (id, name, scenario_type, status, parent_scenario_id,
                                branched_at_revision, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            scenario.id,
            scenario.name,
            scenario.scenario_type.as_str(),
            scenario.status.as_str(),
            scenario.parent_scenario_id,
            scenario.branched_at_revision,
            scenario.created_by,
            ts(&scenario.created_at),
            ts(&scenario.updated_at),
        ],
    )?;
    debug!(scenario_id = %scenario.id, "inserted scenario");
    Ok(())
}

pub fn get_scenario(conn: &Connection, id: &str) -> Result<Option<Scenario>, DatabaseError> {
    let sql = format!("SELECT {SCENARIO_COLUMNS} FROM scenarios WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], scenario_from_row).optional()?)
}

/// All scenarios ordered by creation time.
pub fn list_scenarios(
    conn: &Connection,
    include_archived: bool,
) -> Result<Vec<Scenario>, DatabaseError> {
    let sql = if include_archived {
        format!("SELECT {SCENARIO_COLUMNS} FROM scenarios ORDER BY created_at, id")
    } else {
        format!(
            "SELECT {SCENARIO_COLUMNS} FROM scenarios WHERE status != 'archived'
             ORDER BY created_at, id"
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], scenario_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn child_scenarios(conn: &Connection, parent_id: &str) -> Result<Vec<Scenario>, DatabaseError> {
    let sql = format!(
        "SELECT {SCENARIO_COLUMNS} FROM scenarios WHERE parent_scenario_id = ?1
         ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![parent_id], scenario_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_live_children(conn: &Connection, parent_id: &str) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM scenarios WHERE parent_scenario_id = ?1 AND status != 'archived'",
        params![parent_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// The oldest non-archived root baseline, if any.
pub fn find_root_baseline(conn: &Connection) -> Result<Option<Scenario>, DatabaseError> {
    let sql = format!(
        "SELECT {SCENARIO_COLUMNS} FROM scenarios
         WHERE parent_scenario_id IS NULL AND scenario_type = 'baseline' AND status != 'archived'
         ORDER BY created_at, id LIMIT 1"
    );
    Ok(conn.query_row(&sql, [], scenario_from_row).optional()?)
}

pub fn update_scenario_status(
    conn: &Connection,
    id: &str,
    status: ScenarioStatus,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE scenarios SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), ts(now), id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "scenario".into(),
            id: id.into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// branch_metadata
// ---------------------------------------------------------------------------

const BRANCH_COLUMNS: &str =
    "scenario_id, branch_name, parent_branch, created_by, created_at, merge_status, last_synced_at";

fn branch_from_row(row: &Row<'_>) -> rusqlite::Result<BranchMetadata> {
    Ok(BranchMetadata {
        scenario_id: row.get(0)?,
        branch_name: row.get(1)?,
        parent_branch: row.get(2)?,
        created_by: row.get(3)?,
        created_at: ts_col(row, 4)?,
        merge_status: enum_col(row, 5)?,
        last_synced_at: opt_ts_col(row, 6)?,
    })
}

pub fn insert_branch(conn: &Connection, branch: &BranchMetadata) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO branch_metadata (scenario_id, branch_name, parent_branch, created_by,
                                      created_at, merge_status, last_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            branch.scenario_id,
            branch.branch_name,
            branch.parent_branch,
            branch.created_by,
            ts(&branch.created_at),
            branch.merge_status.as_str(),
            branch.last_synced_at.as_ref().map(ts),
        ],
    )?;
    Ok(())
}

pub fn get_branch(
    conn: &Connection,
    scenario_id: &str,
) -> Result<Option<BranchMetadata>, DatabaseError> {
    let sql = format!("SELECT {BRANCH_COLUMNS} FROM branch_metadata WHERE scenario_id = ?1");
    Ok(conn
        .query_row(&sql, params![scenario_id], branch_from_row)
        .optional()?)
}

pub fn branch_name_taken(conn: &Connection, branch_name: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM branch_metadata WHERE branch_name = ?1",
        params![branch_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn update_merge_status(
    conn: &Connection,
    scenario_id: &str,
    status: MergeStatus,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE branch_metadata SET merge_status = ?1 WHERE scenario_id = ?2",
        params![status.as_str(), scenario_id],
    )?;
    Ok(())
}

pub fn touch_last_synced(
    conn: &Connection,
    scenario_id: &str,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE branch_metadata SET last_synced_at = ?1 WHERE scenario_id = ?2",
        params![ts(at), scenario_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// entity_versions
// ---------------------------------------------------------------------------

/// Highest revision in the arena (0 when empty).
pub fn max_revision(conn: &Connection) -> Result<i64, DatabaseError> {
    let rev: Option<i64> =
        conn.query_row("SELECT MAX(revision) FROM entity_versions", [], |row| row.get(0))?;
    Ok(rev.unwrap_or(0))
}

/// Append one entity version; `data == None` writes a tombstone.
pub fn insert_entity_version(
    conn: &Connection,
    scenario_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    data: Option<&str>,
    now: &DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO entity_versions (scenario_id, entity_type, entity_id, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![scenario_id, entity_type.as_str(), entity_id, data, ts(now)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The latest version of every entity written directly in `scenario_id`,
/// considering only revisions `<= up_to`.
pub fn latest_versions(
    conn: &Connection,
    scenario_id: &str,
    up_to: i64,
) -> Result<Vec<EntityVersionRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT v.revision, v.entity_type, v.entity_id, v.data
         FROM entity_versions v
         JOIN (SELECT entity_type, entity_id, MAX(revision) AS rev
               FROM entity_versions
               WHERE scenario_id = ?1 AND revision <= ?2
               GROUP BY entity_type, entity_id) latest
           ON v.revision = latest.rev
         ORDER BY v.revision",
    )?;
    let rows = stmt
        .query_map(params![scenario_id, up_to], |row| {
            Ok(EntityVersionRow {
                revision: row.get(0)?,
                entity_type: enum_col(row, 1)?,
                entity_id: row.get(2)?,
                data: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// sync_operations
// ---------------------------------------------------------------------------

const OPERATION_COLUMNS: &str = "id, operation_type, status, scenario_id, target_scenario_id, \
     started_at, completed_at, conflict_count, error_message, user_id";

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<SyncOperation> {
    Ok(SyncOperation {
        id: row.get(0)?,
        operation_type: enum_col(row, 1)?,
        status: enum_col(row, 2)?,
        scenario_id: row.get(3)?,
        target_scenario_id: row.get(4)?,
        started_at: ts_col(row, 5)?,
        completed_at: opt_ts_col(row, 6)?,
        conflict_count: row.get(7)?,
        error_message: row.get(8)?,
        user_id: row.get(9)?,
    })
}

pub fn insert_sync_operation(conn: &Connection, op: &SyncOperation) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO sync_operations (id, operation_type, status, scenario_id, target_scenario_id,
                                      started_at, completed_at, conflict_count, error_message,
                                      user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            op.id,
            op.operation_type.as_str(),
            op.status.as_str(),
            op.scenario_id,
            op.target_scenario_id,
            ts(&op.started_at),
            op.completed_at.as_ref().map(ts),
            op.conflict_count,
            op.error_message,
            op.user_id,
        ],
    )?;
    debug!(operation_id = %op.id, kind = %op.operation_type, "inserted sync operation");
    Ok(())
}

pub fn get_sync_operation(
    conn: &Connection,
    id: &str,
) -> Result<Option<SyncOperation>, DatabaseError> {
    let sql = format!("SELECT {OPERATION_COLUMNS} FROM sync_operations WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], operation_from_row).optional()?)
}

/// Persist the mutable columns of an operation (status, completion,
/// conflict count, error message and the scenarios it settled on).
pub fn update_sync_operation(conn: &Connection, op: &SyncOperation) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE sync_operations
         SET status = ?1, completed_at = ?2, conflict_count = ?3, error_message = ?4,
             scenario_id = ?5, target_scenario_id = ?6
         WHERE id = ?7",
        params![
            op.status.as_str(),
            op.completed_at.as_ref().map(ts),
            op.conflict_count,
            op.error_message,
            op.scenario_id,
            op.target_scenario_id,
            op.id,
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "sync operation".into(),
            id: op.id.clone(),
        });
    }
    Ok(())
}

/// Most recent operations first, optionally restricted to one scenario
/// (as either source or target).
pub fn list_sync_operations(
    conn: &Connection,
    scenario_id: Option<&str>,
    limit: u32,
) -> Result<Vec<SyncOperation>, DatabaseError> {
    let rows = match scenario_id {
        Some(scenario_id) => {
            let sql = format!(
                "SELECT {OPERATION_COLUMNS} FROM sync_operations
                 WHERE scenario_id = ?1 OR target_scenario_id = ?1
                 ORDER BY started_at DESC, id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![scenario_id, limit], operation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {OPERATION_COLUMNS} FROM sync_operations
                 ORDER BY started_at DESC, id DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit], operation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Operations on `scenario_id` halted in `conflict`, oldest first.
pub fn parked_operations(
    conn: &Connection,
    scenario_id: &str,
) -> Result<Vec<SyncOperation>, DatabaseError> {
    let sql = format!(
        "SELECT {OPERATION_COLUMNS} FROM sync_operations
         WHERE scenario_id = ?1 AND status = 'conflict'
         ORDER BY started_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![scenario_id], operation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Park (or clear, with `None`) the fetched remote payload on an operation.
pub fn set_parked_payload(
    conn: &Connection,
    operation_id: &str,
    parked: Option<&ParkedPayload>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE sync_operations SET remote_payload = ?1, remote_sha = ?2, remote_base_sha = ?3
         WHERE id = ?4",
        params![
            parked.map(|p| p.payload.as_str()),
            parked.map(|p| p.commit_sha.as_str()),
            parked.and_then(|p| p.base_sha.as_deref()),
            operation_id,
        ],
    )?;
    Ok(())
}

pub fn get_parked_payload(
    conn: &Connection,
    operation_id: &str,
) -> Result<Option<ParkedPayload>, DatabaseError> {
    type ParkedColumns = (Option<String>, Option<String>, Option<String>);
    let row: Option<ParkedColumns> = conn
        .query_row(
            "SELECT remote_payload, remote_sha, remote_base_sha FROM sync_operations
             WHERE id = ?1",
            params![operation_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    Ok(match row {
        Some((Some(payload), Some(commit_sha), base_sha)) => Some(ParkedPayload {
            payload,
            commit_sha,
            base_sha,
        }),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// conflicts
// ---------------------------------------------------------------------------

const CONFLICT_COLUMNS: &str = "id, sync_operation_id, entity_type, entity_id, entity_name, field, \
     base_value, local_value, remote_value, resolution_status, resolved_value, resolved_by, \
     resolved_at, created_at";

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<Conflict> {
    Ok(Conflict {
        id: row.get(0)?,
        sync_operation_id: row.get(1)?,
        entity_type: enum_col(row, 2)?,
        entity_id: row.get(3)?,
        entity_name: row.get(4)?,
        field: row.get(5)?,
        base_value: json_col(row, 6)?,
        local_value: json_col(row, 7)?,
        remote_value: json_col(row, 8)?,
        resolution_status: enum_col(row, 9)?,
        resolved_value: opt_json_col(row, 10)?,
        resolved_by: row.get(11)?,
        resolved_at: opt_ts_col(row, 12)?,
        created_at: ts_col(row, 13)?,
    })
}

pub fn insert_conflict(conn: &Connection, conflict: &Conflict) -> Result<(), DatabaseError> {
    let resolved_value = conflict
        .resolved_value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO conflicts (id, sync_operation_id, entity_type, entity_id, entity_name, field,
                                base_value, local_value, remote_value, resolution_status,
                                resolved_value, resolved_by, resolved_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            conflict.id,
            conflict.sync_operation_id,
            conflict.entity_type.as_str(),
            conflict.entity_id,
            conflict.entity_name,
            conflict.field,
            serde_json::to_string(&conflict.base_value)?,
            serde_json::to_string(&conflict.local_value)?,
            serde_json::to_string(&conflict.remote_value)?,
            conflict.resolution_status.as_str(),
            resolved_value,
            conflict.resolved_by,
            conflict.resolved_at.as_ref().map(ts),
            ts(&conflict.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_conflict(conn: &Connection, id: &str) -> Result<Option<Conflict>, DatabaseError> {
    let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], conflict_from_row).optional()?)
}

pub fn list_conflicts_for_operation(
    conn: &Connection,
    operation_id: &str,
) -> Result<Vec<Conflict>, DatabaseError> {
    let sql = format!(
        "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE sync_operation_id = ?1
         ORDER BY entity_type, entity_id, field"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![operation_id], conflict_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Non-resolved conflicts of every halted (`conflict`) operation on the
/// scenario.
pub fn outstanding_conflicts_for_scenario(
    conn: &Connection,
    scenario_id: &str,
) -> Result<Vec<Conflict>, DatabaseError> {
    let sql = format!(
        "SELECT {CONFLICT_COLUMNS} FROM conflicts
         WHERE resolution_status != 'resolved'
           AND sync_operation_id IN (SELECT id FROM sync_operations
                                     WHERE scenario_id = ?1 AND status = 'conflict')
         ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![scenario_id], conflict_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Persist the resolution columns of a conflict.
pub fn update_conflict_resolution(
    conn: &Connection,
    conflict: &Conflict,
) -> Result<(), DatabaseError> {
    let resolved_value = conflict
        .resolved_value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "UPDATE conflicts
         SET resolution_status = ?1, resolved_value = ?2, resolved_by = ?3, resolved_at = ?4
         WHERE id = ?5",
        params![
            conflict.resolution_status.as_str(),
            resolved_value,
            conflict.resolved_by,
            conflict.resolved_at.as_ref().map(ts),
            conflict.id,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// scenario_locks
// ---------------------------------------------------------------------------

pub fn get_lock(conn: &Connection, lock_key: &str) -> Result<Option<LockRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT lock_key, operation_id, acquired_at FROM scenario_locks WHERE lock_key = ?1",
            params![lock_key],
            |row| {
                Ok(LockRow {
                    lock_key: row.get(0)?,
                    operation_id: row.get(1)?,
                    acquired_at: ts_col(row, 2)?,
                })
            },
        )
        .optional()?)
}

pub fn insert_lock(
    conn: &Connection,
    lock_key: &str,
    operation_id: &str,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO scenario_locks (lock_key, operation_id, acquired_at) VALUES (?1, ?2, ?3)",
        params![lock_key, operation_id, ts(now)],
    )?;
    Ok(())
}

pub fn delete_lock(conn: &Connection, lock_key: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM scenario_locks WHERE lock_key = ?1",
        params![lock_key],
    )?;
    Ok(())
}

/// Release `lock_key` if `operation_id` still holds it.
pub fn delete_owned_lock(
    conn: &Connection,
    lock_key: &str,
    operation_id: &str,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM scenario_locks WHERE lock_key = ?1 AND operation_id = ?2",
        params![lock_key, operation_id],
    )?)
}

/// Release every lock held by `operation_id`; returns how many were held.
pub fn delete_locks_for_operation(
    conn: &Connection,
    operation_id: &str,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM scenario_locks WHERE operation_id = ?1",
        params![operation_id],
    )?)
}

// ---------------------------------------------------------------------------
// git_credentials
// ---------------------------------------------------------------------------

const CREDENTIAL_COLUMNS: &str = "user_id, provider, credential_type, token, repository_url, \
     expires_at, created_at, last_used_at";

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<GitCredential> {
    Ok(GitCredential {
        user_id: row.get(0)?,
        provider: row.get(1)?,
        credential_type: row.get(2)?,
        token: row.get(3)?,
        repository_url: row.get(4)?,
        expires_at: opt_ts_col(row, 5)?,
        created_at: ts_col(row, 6)?,
        last_used_at: opt_ts_col(row, 7)?,
    })
}

pub fn insert_credential(conn: &Connection, cred: &GitCredential) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO git_credentials (user_id, provider, credential_type, token, repository_url,
                                      expires_at, created_at, last_used_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            cred.user_id,
            cred.provider,
            cred.credential_type,
            cred.token,
            cred.repository_url,
            cred.expires_at.as_ref().map(ts),
            ts(&cred.created_at),
            cred.last_used_at.as_ref().map(ts),
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, user_id = %cred.user_id, "stored git credential");
    Ok(id)
}

/// Newest credential for the user and repository.
pub fn find_credential(
    conn: &Connection,
    user_id: &str,
    repository_url: &str,
) -> Result<Option<GitCredential>, DatabaseError> {
    let sql = format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM git_credentials
         WHERE user_id = ?1 AND repository_url = ?2
         ORDER BY created_at DESC, id DESC LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![user_id, repository_url], credential_from_row)
        .optional()?)
}

pub fn list_credentials(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<GitCredential>, DatabaseError> {
    let sql = format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM git_credentials WHERE user_id = ?1
         ORDER BY created_at DESC, id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![user_id], credential_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn touch_credential(
    conn: &Connection,
    user_id: &str,
    repository_url: &str,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE git_credentials SET last_used_at = ?1 WHERE user_id = ?2 AND repository_url = ?3",
        params![ts(at), user_id, repository_url],
    )?;
    Ok(())
}

pub fn delete_credentials(
    conn: &Connection,
    user_id: &str,
    repository_url: &str,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM git_credentials WHERE user_id = ?1 AND repository_url = ?2",
        params![user_id, repository_url],
    )?)
}

// ---------------------------------------------------------------------------
// sync_bases
// ---------------------------------------------------------------------------

pub fn upsert_sync_base(conn: &Connection, base: &SyncBaseRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO sync_bases (scenario_id, branch_name, commit_sha, snapshot, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(scenario_id) DO UPDATE SET
             branch_name = excluded.branch_name,
             commit_sha = excluded.commit_sha,
             snapshot = excluded.snapshot,
             synced_at = excluded.synced_at",
        params![
            base.scenario_id,
            base.branch_name,
            base.commit_sha,
            base.snapshot,
            ts(&base.synced_at),
        ],
    )?;
    Ok(())
}

pub fn get_sync_base(
    conn: &Connection,
    scenario_id: &str,
) -> Result<Option<SyncBaseRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT scenario_id, branch_name, commit_sha, snapshot, synced_at
             FROM sync_bases WHERE scenario_id = ?1",
            params![scenario_id],
            |row| {
                Ok(SyncBaseRow {
                    scenario_id: row.get(0)?,
                    branch_name: row.get(1)?,
                    commit_sha: row.get(2)?,
                    snapshot: row.get(3)?,
                    synced_at: ts_col(row, 4)?,
                })
            },
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// change_history
// ---------------------------------------------------------------------------

const HISTORY_COLUMNS: &str = "h.id, h.commit_sha, h.scenario_id, h.sync_operation_id, h.author, \
     h.author_name, h.timestamp, h.message, h.files_changed, h.added, h.removed";

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeHistoryEntry> {
    let files: String = row.get(8)?;
    let files_changed: Vec<String> =
        serde_json::from_str(&files).map_err(|e| conversion_err(8, e))?;
    let added: i64 = row.get(9)?;
    let removed: i64 = row.get(10)?;
    Ok(ChangeHistoryEntry {
        id: Some(row.get(0)?),
        commit_sha: row.get(1)?,
        scenario_id: row.get(2)?,
        sync_operation_id: row.get(3)?,
        author: row.get(4)?,
        author_name: row.get(5)?,
        timestamp: ts_col(row, 6)?,
        message: row.get(7)?,
        files_changed,
        entities_affected: Vec::new(),
        diff_summary: DiffSummary {
            added: added.max(0) as u64,
            removed: removed.max(0) as u64,
        },
    })
}

/// Append a history entry and its affected-entity index rows; returns the
/// new row id.
pub fn insert_history(conn: &Connection, entry: &ChangeHistoryEntry) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO change_history (commit_sha, scenario_id, sync_operation_id, author,
                                     author_name, timestamp, message, files_changed, added,
                                     removed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.commit_sha,
            entry.scenario_id,
            entry.sync_operation_id,
            entry.author,
            entry.author_name,
            ts(&entry.timestamp),
            entry.message,
            serde_json::to_string(&entry.files_changed)?,
            entry.diff_summary.added as i64,
            entry.diff_summary.removed as i64,
        ],
    )?;
    let id = conn.last_insert_rowid();

    let mut stmt = conn.prepare(
        "INSERT INTO change_history_entities (history_id, entity_type, entity_id, action)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for entity in &entry.entities_affected {
        stmt.execute(params![
            id,
            entity.entity_type.as_str(),
            entity.entity_id,
            entity.action.as_str(),
        ])?;
    }
    debug!(id, commit_sha = %entry.commit_sha, "inserted change history entry");
    Ok(id)
}

fn attach_entities(
    conn: &Connection,
    entries: &mut [ChangeHistoryEntry],
) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, action FROM change_history_entities
         WHERE history_id = ?1 ORDER BY rowid",
    )?;
    for entry in entries.iter_mut() {
        let Some(id) = entry.id else { continue };
        entry.entities_affected = stmt
            .query_map(params![id], |row| {
                Ok(EntityRef {
                    entity_type: enum_col(row, 0)?,
                    entity_id: row.get(1)?,
                    action: enum_col(row, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(())
}

/// History entries that touched one entity, newest first, with ids below
/// `before_id`.
pub fn history_for_entity(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    before_id: Option<i64>,
    limit: u32,
) -> Result<Vec<ChangeHistoryEntry>, DatabaseError> {
    let sql = format!(
        "SELECT {HISTORY_COLUMNS} FROM change_history h
         WHERE h.id < ?3
           AND EXISTS (SELECT 1 FROM change_history_entities e
                       WHERE e.history_id = h.id AND e.entity_type = ?1 AND e.entity_id = ?2)
         ORDER BY h.id DESC LIMIT ?4"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(
            params![
                entity_type.as_str(),
                entity_id,
                before_id.unwrap_or(i64::MAX),
                limit
            ],
            history_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    attach_entities(conn, &mut rows)?;
    Ok(rows)
}

/// History entries of one scenario, newest first, with ids below
/// `before_id`.
pub fn history_for_scenario(
    conn: &Connection,
    scenario_id: &str,
    before_id: Option<i64>,
    limit: u32,
) -> Result<Vec<ChangeHistoryEntry>, DatabaseError> {
    let sql = format!(
        "SELECT {HISTORY_COLUMNS} FROM change_history h
         WHERE h.scenario_id = ?1 AND h.id < ?2
         ORDER BY h.id DESC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(
            params![scenario_id, before_id.unwrap_or(i64::MAX), limit],
            history_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    attach_entities(conn, &mut rows)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{
        EntityAction, ResolutionStatus, ScenarioType, SyncOperationStatus, SyncOperationType,
    };
    use serde_json::json;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn scenario(id: &str, parent: Option<&str>) -> Scenario {
        let now = Utc::now();
        Scenario {
            id: id.into(),
            name: format!("Scenario {id}"),
            scenario_type: if parent.is_none() {
                ScenarioType::Baseline
            } else {
                ScenarioType::WhatIf
            },
            status: ScenarioStatus::Active,
            parent_scenario_id: parent.map(str::to_string),
            branched_at_revision: 0,
            created_by: "alice".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn operation(id: &str, scenario_id: &str, status: SyncOperationStatus) -> SyncOperation {
        SyncOperation {
            id: id.into(),
            operation_type: SyncOperationType::Merge,
            status,
            scenario_id: Some(scenario_id.into()),
            target_scenario_id: None,
            started_at: Utc::now(),
            completed_at: None,
            conflict_count: 0,
            error_message: None,
            user_id: "alice".into(),
        }
    }

    #[test]
    fn test_scenario_crud() {
        let db = setup_db();
        let conn = db.conn();
        insert_scenario(&conn, &scenario("root", None)).unwrap();
        insert_scenario(&conn, &scenario("child", Some("root"))).unwrap();

        let loaded = get_scenario(&conn, "child").unwrap().unwrap();
        assert_eq!(loaded.parent_scenario_id.as_deref(), Some("root"));
        assert_eq!(loaded.scenario_type, ScenarioType::WhatIf);
        assert_eq!(count_live_children(&conn, "root").unwrap(), 1);

        update_scenario_status(&conn, "child", ScenarioStatus::Archived, &Utc::now()).unwrap();
        assert_eq!(count_live_children(&conn, "root").unwrap(), 0);
        assert_eq!(list_scenarios(&conn, false).unwrap().len(), 1);
        assert_eq!(list_scenarios(&conn, true).unwrap().len(), 2);
        assert_eq!(find_root_baseline(&conn).unwrap().unwrap().id, "root");
        assert!(get_scenario(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_latest_versions_respects_cutoff() {
        let db = setup_db();
        let conn = db.conn();
        insert_scenario(&conn, &scenario("root", None)).unwrap();
        let now = Utc::now();
        let r1 = insert_entity_version(
            &conn,
            "root",
            EntityType::Project,
            "p1",
            Some(r#"{"name":"A"}"#),
            &now,
        )
        .unwrap();
        insert_entity_version(&conn, "root", EntityType::Project, "p1", None, &now).unwrap();

        let latest = latest_versions(&conn, "root", i64::MAX).unwrap();
        assert_eq!(latest.len(), 1);
        assert!(latest[0].data.is_none());

        let at_r1 = latest_versions(&conn, "root", r1).unwrap();
        assert_eq!(at_r1[0].data.as_deref(), Some(r#"{"name":"A"}"#));
        assert_eq!(max_revision(&conn).unwrap(), r1 + 1);
    }

    #[test]
    fn test_conflict_round_trip_and_outstanding() {
        let db = setup_db();
        let conn = db.conn();
        insert_scenario(&conn, &scenario("root", None)).unwrap();
        insert_sync_operation(&conn, &operation("op1", "root", SyncOperationStatus::Conflict))
            .unwrap();

        let mut conflict = Conflict {
            id: "c1".into(),
            sync_operation_id: "op1".into(),
            entity_type: EntityType::Assignment,
            entity_id: "a1".into(),
            entity_name: Some("Alice on Apollo".into()),
            field: "allocation_percentage".into(),
            base_value: json!(50),
            local_value: json!(60),
            remote_value: json!(70),
            resolution_status: ResolutionStatus::Pending,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        insert_conflict(&conn, &conflict).unwrap();
        assert_eq!(outstanding_conflicts_for_scenario(&conn, "root").unwrap().len(), 1);

        conflict.resolution_status = ResolutionStatus::Resolved;
        conflict.resolved_value = Some(json!(65));
        conflict.resolved_by = Some("bob".into());
        conflict.resolved_at = Some(Utc::now());
        update_conflict_resolution(&conn, &conflict).unwrap();

        let loaded = get_conflict(&conn, "c1").unwrap().unwrap();
        assert_eq!(loaded.resolved_value, Some(json!(65)));
        assert_eq!(loaded.base_value, json!(50));
        assert!(outstanding_conflicts_for_scenario(&conn, "root").unwrap().is_empty());
    }

    #[test]
    fn test_lock_rows_are_exclusive() {
        let db = setup_db();
        let conn = db.conn();
        let now = Utc::now();
        insert_lock(&conn, "scenario:a", "op1", &now).unwrap();
        assert!(insert_lock(&conn, "scenario:a", "op2", &now).is_err());
        assert_eq!(get_lock(&conn, "scenario:a").unwrap().unwrap().operation_id, "op1");
        assert_eq!(delete_locks_for_operation(&conn, "op1").unwrap(), 1);
        assert!(get_lock(&conn, "scenario:a").unwrap().is_none());
    }

    #[test]
    fn test_history_paging_by_entity() {
        let db = setup_db();
        let conn = db.conn();
        for i in 0..3 {
            let entry = ChangeHistoryEntry {
                id: None,
                commit_sha: format!("sha{i}"),
                scenario_id: "root".into(),
                sync_operation_id: None,
                author: "alice".into(),
                author_name: "alice".into(),
                timestamp: Utc::now(),
                message: format!("edit {i}"),
                files_changed: vec!["projects".into()],
                entities_affected: vec![EntityRef {
                    entity_type: EntityType::Project,
                    entity_id: "p1".into(),
                    action: EntityAction::Updated,
                }],
                diff_summary: DiffSummary { added: 1, removed: 1 },
            };
            insert_history(&conn, &entry).unwrap();
        }

        let page = history_for_entity(&conn, EntityType::Project, "p1", None, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].commit_sha, "sha2");
        assert_eq!(page[0].entities_affected.len(), 1);

        let rest =
            history_for_entity(&conn, EntityType::Project, "p1", page[1].id, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].commit_sha, "sha0");
    }
}
