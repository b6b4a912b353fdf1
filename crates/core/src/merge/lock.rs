//! Persistent locks serializing merges and syncs per scenario.
//!
//! Locks live in the `scenario_locks` table so that they are visible to every
//! process sharing the database. A lock is owned by a sync operation id and
//! is released when the owning [`LockGuard`] is dropped.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::db::{queries, Database};
use crate::errors::{DatabaseError, MergeError, SyncError};

/// Lock key for a scenario.
pub fn scenario_key(scenario_id: &str) -> String {
    format!("scenario:{scenario_id}")
}

/// Lock key for a remote repository (used by clone).
pub fn repository_key(url: &str) -> String {
    format!("repository:{url}")
}

/// A lock requested by one operation is held by another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeld {
    pub lock_key: String,
    pub held_by: String,
}

impl From<LockHeld> for MergeError {
    fn from(held: LockHeld) -> Self {
        MergeError::LockConflict {
            lock_key: held.lock_key,
            held_by: held.held_by,
        }
    }
}

impl From<LockHeld> for SyncError {
    fn from(held: LockHeld) -> Self {
        SyncError::LockConflict {
            lock_key: held.lock_key,
            held_by: held.held_by,
        }
    }
}

pub struct LockManager {
    db: Arc<Database>,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(db: Arc<Database>, stale_after_secs: u64) -> Self {
        let secs = i64::try_from(stale_after_secs).unwrap_or(i64::MAX / 1000);
        Self {
            db,
            stale_after: Duration::seconds(secs),
        }
    }

    /// Take every lock in `keys` for `operation_id`, all or nothing.
    ///
    /// Keys are taken in sorted order. A lock already held by the same
    /// operation is re-entered and stays owned by the guard that first took
    /// it. A lock older than the stale threshold is reclaimed and its owning
    /// operation, if still live, is marked failed.
    pub fn acquire<E>(&self, keys: &[String], operation_id: &str) -> Result<LockGuard, E>
    where
        E: From<DatabaseError> + From<LockHeld>,
    {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let taken = self.db.transaction(|conn| {
            let now = Utc::now();
            let mut taken = Vec::with_capacity(keys.len());
            for key in &keys {
                match queries::get_lock(conn, key)? {
                    None => {}
                    Some(lock) if lock.operation_id == operation_id => continue,
                    Some(lock) if now - lock.acquired_at > self.stale_after => {
                        warn!(
                            lock_key = %key,
                            held_by = %lock.operation_id,
                            acquired_at = %lock.acquired_at,
                            "reclaiming stale lock"
                        );
                        if let Some(mut holder) =
                            queries::get_sync_operation(conn, &lock.operation_id)?
                        {
                            if holder.status.is_live() && holder.fail("lock reclaimed as stale") {
                                queries::update_sync_operation(conn, &holder)?;
                            }
                        }
                        queries::delete_lock(conn, key)?;
                    }
                    Some(lock) => {
                        return Err(E::from(LockHeld {
                            lock_key: key.clone(),
                            held_by: lock.operation_id,
                        }));
                    }
                }
                queries::insert_lock(conn, key, operation_id, &now)?;
                taken.push(key.clone());
            }
            Ok::<_, E>(taken)
        })?;

        debug!(operation_id, keys = ?taken, "locks acquired");
        Ok(LockGuard {
            db: Arc::clone(&self.db),
            operation_id: operation_id.to_string(),
            keys: taken,
            released: false,
        })
    }
}

/// Releases the locks it took when dropped. Keys it only re-entered stay
/// with the guard that took them first.
///
/// Must not be dropped while the same thread holds the database connection.
pub struct LockGuard {
    db: Arc<Database>,
    operation_id: String,
    keys: Vec<String>,
    released: bool,
}

impl LockGuard {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Keys this guard took and will release.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Release now, reporting database errors instead of logging them.
    pub fn release(mut self) -> Result<(), DatabaseError> {
        self.released = true;
        self.release_keys()?;
        Ok(())
    }

    fn release_keys(&self) -> Result<usize, DatabaseError> {
        let conn = self.db.conn();
        let mut count = 0;
        for key in &self.keys {
            count += queries::delete_owned_lock(&conn, key, &self.operation_id)?;
        }
        Ok(count)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.release_keys() {
            Ok(count) => debug!(operation_id = %self.operation_id, count, "locks released"),
            Err(e) => warn!(
                operation_id = %self.operation_id,
                error = %e,
                "failed to release locks"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncOperation, SyncOperationStatus, SyncOperationType};

    fn setup() -> (Arc<Database>, LockManager) {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let locks = LockManager::new(Arc::clone(&db), 900);
        (db, locks)
    }

    fn held(db: &Database, key: &str) -> Option<String> {
        queries::get_lock(&db.conn(), key).unwrap().map(|l| l.operation_id)
    }

    #[test]
    fn test_second_operation_is_refused() {
        let (db, locks) = setup();
        let keys = vec![scenario_key("a"), scenario_key("b")];
        let guard: LockGuard = locks.acquire::<MergeError>(&keys, "op-1").unwrap();

        let err = locks
            .acquire::<MergeError>(&[scenario_key("b")], "op-2")
            .err()
            .unwrap();
        assert!(matches!(
            err,
            MergeError::LockConflict { ref held_by, .. } if held_by == "op-1"
        ));

        drop(guard);
        assert!(held(&db, &scenario_key("a")).is_none());
        let _guard = locks.acquire::<SyncError>(&keys, "op-2").unwrap();
        assert_eq!(held(&db, &scenario_key("b")).as_deref(), Some("op-2"));
    }

    #[test]
    fn test_failed_acquire_takes_nothing() {
        let (db, locks) = setup();
        let _guard = locks
            .acquire::<MergeError>(&[scenario_key("b")], "op-1")
            .unwrap();
        let result = locks.acquire::<MergeError>(&[scenario_key("a"), scenario_key("b")], "op-2");
        assert!(result.is_err());
        assert!(held(&db, &scenario_key("a")).is_none());
    }

    #[test]
    fn test_reentrant_for_same_operation() {
        let (_db, locks) = setup();
        let _a = locks
            .acquire::<MergeError>(&[scenario_key("a")], "op-1")
            .unwrap();
        assert!(locks
            .acquire::<MergeError>(&[scenario_key("a"), scenario_key("c")], "op-1")
            .is_ok());
    }

    #[test]
    fn test_inner_guard_leaves_outer_keys_held() {
        let (db, locks) = setup();
        let outer = locks
            .acquire::<SyncError>(&[repository_key("https://git.example.com/p.git")], "op-1")
            .unwrap();
        let inner = locks
            .acquire::<SyncError>(
                &[repository_key("https://git.example.com/p.git"), scenario_key("root")],
                "op-1",
            )
            .unwrap();
        assert_eq!(inner.keys(), [scenario_key("root")]);

        drop(inner);
        assert!(held(&db, &scenario_key("root")).is_none());
        assert_eq!(
            held(&db, &repository_key("https://git.example.com/p.git")).as_deref(),
            Some("op-1")
        );
        let err = locks
            .acquire::<SyncError>(&[repository_key("https://git.example.com/p.git")], "op-2")
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::LockConflict { .. }));

        drop(outer);
        assert!(held(&db, &repository_key("https://git.example.com/p.git")).is_none());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let (db, _) = setup();
        let mut holder = SyncOperation::begin(SyncOperationType::Merge, "alice", None, None);
        holder.advance(SyncOperationStatus::InProgress);
        {
            let conn = db.conn();
            queries::insert_sync_operation(&conn, &holder).unwrap();
            let long_ago = Utc::now() - Duration::hours(2);
            queries::insert_lock(&conn, &scenario_key("a"), &holder.id, &long_ago).unwrap();
        }

        let locks = LockManager::new(Arc::clone(&db), 60);
        let guard = locks
            .acquire::<MergeError>(&[scenario_key("a")], "op-2")
            .unwrap();
        assert_eq!(held(&db, &scenario_key("a")).as_deref(), Some("op-2"));

        let holder = queries::get_sync_operation(&db.conn(), &holder.id)
            .unwrap()
            .unwrap();
        assert_eq!(holder.status, SyncOperationStatus::Failed);

        guard.release().unwrap();
        assert!(held(&db, &scenario_key("a")).is_none());
    }
}
