//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "scenario graph, entity arena, merges and history",
        r#"
        CREATE TABLE IF NOT EXISTS scenarios (
            id                   TEXT PRIMARY KEY,
            name                 TEXT NOT NULL,
            scenario_type        TEXT NOT NULL,
            status               TEXT NOT NULL DEFAULT 'draft'
                                 CHECK (status IN ('draft', 'active', 'archived')),
            parent_scenario_id   TEXT REFERENCES scenarios (id),
            branched_at_revision INTEGER NOT NULL DEFAULT 0,
            created_by           TEXT NOT NULL,
            created_at           TEXT NOT NULL,
            updated_at           TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_scenarios_parent ON scenarios (parent_scenario_id);

        CREATE TABLE IF NOT EXISTS branch_metadata (
            scenario_id    TEXT PRIMARY KEY REFERENCES scenarios (id),
            branch_name    TEXT NOT NULL UNIQUE,
            parent_branch  TEXT,
            created_by     TEXT NOT NULL,
            created_at     TEXT NOT NULL,
            merge_status   TEXT NOT NULL DEFAULT 'unmerged',
            last_synced_at TEXT
        );

        CREATE TABLE IF NOT EXISTS entity_versions (
            revision    INTEGER PRIMARY KEY AUTOINCREMENT,
            scenario_id TEXT NOT NULL REFERENCES scenarios (id),
            entity_type TEXT NOT NULL,
            entity_id   TEXT NOT NULL,
            data        TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entity_versions_lookup
            ON entity_versions (scenario_id, entity_type, entity_id, revision);

        CREATE TABLE IF NOT EXISTS sync_operations (
            id                 TEXT PRIMARY KEY,
            operation_type     TEXT NOT NULL,
            status             TEXT NOT NULL,
            scenario_id        TEXT,
            target_scenario_id TEXT,
            started_at         TEXT NOT NULL,
            completed_at       TEXT,
            conflict_count     INTEGER NOT NULL DEFAULT 0,
            error_message      TEXT,
            user_id            TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_operations_scenario
            ON sync_operations (scenario_id, started_at);

        CREATE TABLE IF NOT EXISTS conflicts (
            id                TEXT PRIMARY KEY,
            sync_operation_id TEXT NOT NULL REFERENCES sync_operations (id),
            entity_type       TEXT NOT NULL,
            entity_id         TEXT NOT NULL,
            entity_name       TEXT,
            field             TEXT NOT NULL,
            base_value        TEXT NOT NULL,
            local_value       TEXT NOT NULL,
            remote_value      TEXT NOT NULL,
            resolution_status TEXT NOT NULL DEFAULT 'pending',
            resolved_value    TEXT,
            resolved_by       TEXT,
            resolved_at       TEXT,
            created_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_operation ON conflicts (sync_operation_id);

        CREATE TABLE IF NOT EXISTS scenario_locks (
            lock_key     TEXT PRIMARY KEY,
            operation_id TEXT NOT NULL,
            acquired_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS change_history (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            commit_sha        TEXT NOT NULL,
            scenario_id       TEXT NOT NULL,
            sync_operation_id TEXT,
            author            TEXT NOT NULL,
            author_name       TEXT NOT NULL,
            timestamp         TEXT NOT NULL,
            message           TEXT NOT NULL,
            files_changed     TEXT NOT NULL DEFAULT '[]',
            added             INTEGER NOT NULL DEFAULT 0,
            removed           INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_change_history_scenario
            ON change_history (scenario_id, id);

        CREATE TABLE IF NOT EXISTS change_history_entities (
            history_id  INTEGER NOT NULL REFERENCES change_history (id),
            entity_type TEXT NOT NULL,
            entity_id   TEXT NOT NULL,
            action      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_change_history_entities_lookup
            ON change_history_entities (entity_type, entity_id, history_id);
        "#,
    ),
    (
        2,
        "git credentials and sync bases",
        r#"
        CREATE TABLE IF NOT EXISTS git_credentials (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         TEXT NOT NULL,
            provider        TEXT NOT NULL,
            credential_type TEXT NOT NULL,
            token           TEXT NOT NULL,
            repository_url  TEXT NOT NULL,
            expires_at      TEXT,
            created_at      TEXT NOT NULL,
            last_used_at    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_git_credentials_lookup
            ON git_credentials (user_id, repository_url);

        CREATE TABLE IF NOT EXISTS sync_bases (
            scenario_id TEXT PRIMARY KEY REFERENCES scenarios (id),
            branch_name TEXT NOT NULL,
            commit_sha  TEXT NOT NULL,
            snapshot    TEXT NOT NULL,
            synced_at   TEXT NOT NULL
        );

        ALTER TABLE sync_operations ADD COLUMN remote_payload TEXT;
        ALTER TABLE sync_operations ADD COLUMN remote_sha TEXT;
        "#,
    ),
    (
        3,
        "sync base recorded on parked pulls",
        r#"
        ALTER TABLE sync_operations ADD COLUMN remote_base_sha TEXT;
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
