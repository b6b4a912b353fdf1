//! Git-backed scenario synchronization.
//!
//! The [`SyncOrchestrator`] drives clone, pull and push of scenario state
//! against the remote through a [`Repository`]. Every run is a
//! [`SyncOperation`] moving `pending -> in-progress -> {completed | failed |
//! conflict}`:
//!
//! 1. Lock the scenario (or the repository, for clone).
//! 2. Check the caller's credential; missing or expired fails immediately.
//! 3. Run the network leg on the blocking pool under the configured timeout.
//! 4. Reconcile fetched state with local state using the three-way merge
//!    (base = state at the last sync) and commit it in one transaction, or
//!    park the fetched payload and stop in `conflict`.
//!
//! Nothing is retried automatically; a failed or conflicted operation waits
//! for the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::{GitConfig, MergeConfig};
use crate::credentials::CredentialVault;
use crate::db::queries::{self, ParkedPayload, SyncBaseRow};
use crate::db::Database;
use crate::errors::{GitError, ScenarioError, SyncError};
use crate::export::ScenarioExportData;
use crate::git::{PushRequest, RemoteSnapshot, Repository};
use crate::history;
use crate::merge::{self, repository_key, scenario_key, LockGuard, LockManager};
use crate::models::{
    ChangeHistoryEntry, Conflict, ResolutionStatus, Scenario, SyncOperation, SyncOperationStatus,
    SyncOperationType,
};
use crate::scenario::{NewScenario, ScenarioGraph};
use crate::store::{load_snapshot, write_snapshot, Snapshot};

/// Name given to the root baseline when a clone has to create it.
const ROOT_SCENARIO_NAME: &str = "Baseline";

/// Result of a sync operation.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub operation: SyncOperation,
    /// Conflicts raised by this run (empty unless it stopped in `conflict`).
    pub conflicts: Vec<Conflict>,
    /// History entry written by this run, if it changed anything.
    pub history: Option<ChangeHistoryEntry>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator {
    db: Arc<Database>,
    repo: Arc<dyn Repository>,
    vault: Arc<dyn CredentialVault>,
    git: GitConfig,
    locks: LockManager,
    graph: ScenarioGraph,
    max_depth: usize,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<Database>,
        repo: Arc<dyn Repository>,
        vault: Arc<dyn CredentialVault>,
        git: GitConfig,
        merge: &MergeConfig,
    ) -> Self {
        info!(repository_url = %git.repository_url, "initializing sync orchestrator");
        Self {
            locks: LockManager::new(Arc::clone(&db), merge.lock_stale_after_secs),
            graph: ScenarioGraph::new(
                Arc::clone(&db),
                merge.max_hierarchy_depth,
                &git.default_branch,
            ),
            max_depth: merge.max_hierarchy_depth,
            db,
            repo,
            vault,
            git,
        }
    }

    pub fn operation(&self, operation_id: &str) -> Result<SyncOperation, SyncError> {
        self.db
            .read(|conn| queries::get_sync_operation(conn, operation_id))?
            .ok_or_else(|| SyncError::OperationNotFound(operation_id.to_string()))
    }

    /// Most recent operations first, optionally for one scenario.
    pub fn list_operations(
        &self,
        scenario_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SyncOperation>, SyncError> {
        Ok(self
            .db
            .read(|conn| queries::list_sync_operations(conn, scenario_id, limit))?)
    }

    // -----------------------------------------------------------------------
    // Clone
    // -----------------------------------------------------------------------

    /// Mirror the remote and bring its default branch into the root
    /// baseline, creating the baseline when there is none yet.
    pub async fn clone_remote(&self, user: &str) -> Result<SyncOutcome, SyncError> {
        let url = self.git.repository_url.clone();
        let (mut op, guard) =
            self.start(SyncOperationType::Clone, user, None, repository_key(&url))?;
        let token = self.token_for(&mut op)?;

        let branch = self.git.default_branch.clone();
        let fetched = self
            .network(&mut op, "clone", move |repo| {
                repo.clone_remote(&url, Some(&token))?;
                repo.fetch_snapshot(&branch, Some(&token))
            })
            .await?;
        self.mark_used(&op);

        let root = self.root_baseline(user).map_err(|e| self.fail(&mut op, e))?;
        op.scenario_id = Some(root.id.clone());
        let root_guard = self
            .locks
            .acquire::<SyncError>(&[scenario_key(&root.id)], &op.id)
            .map_err(|e| self.fail(&mut op, e))?;
        let branch_name = match self.graph.branch(&root.id) {
            Ok(branch) => branch.branch_name,
            Err(e) => return Err(self.fail(&mut op, e.into())),
        };

        let outcome = match fetched {
            Some(remote) => self.reconcile(op, &branch_name, &remote, &[]),
            None => self.complete_without_changes(op, "remote default branch is empty"),
        };
        drop(root_guard);
        drop(guard);
        outcome
    }

    fn root_baseline(&self, user: &str) -> Result<Scenario, SyncError> {
        if let Some(root) = self.db.read(queries::find_root_baseline)? {
            return Ok(root);
        }
        info!("no root baseline yet, creating one for clone");
        Ok(self.graph.create(NewScenario::root(ROOT_SCENARIO_NAME, user))?)
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    /// Fetch the scenario's branch and merge it into local state.
    pub async fn pull(&self, scenario_id: &str, user: &str) -> Result<SyncOutcome, SyncError> {
        let scenario = self.writable_scenario(scenario_id)?;
        let branch_name = self.graph.branch(&scenario.id)?.branch_name;
        let (mut op, guard) = self.start(
            SyncOperationType::Pull,
            user,
            Some(&scenario.id),
            scenario_key(&scenario.id),
        )?;
        let token = self.token_for(&mut op)?;

        let branch = branch_name.clone();
        let fetched = self
            .network(&mut op, "fetch", move |repo| {
                repo.fetch_snapshot(&branch, Some(&token))
            })
            .await?;
        self.mark_used(&op);

        let outcome = match fetched {
            Some(remote) => self.reconcile(op, &branch_name, &remote, &[]),
            None => self.complete_without_changes(op, "remote branch does not exist yet"),
        };
        drop(guard);
        outcome
    }

    /// Finish a pull (or clone) that stopped in `conflict`, using the payload
    /// fetched back then. Every conflict must be resolved. No network call.
    pub async fn resume(&self, operation_id: &str, user: &str) -> Result<SyncOutcome, SyncError> {
        let op = self.operation(operation_id)?;
        if !matches!(
            op.operation_type,
            SyncOperationType::Pull | SyncOperationType::Clone
        ) || op.status != SyncOperationStatus::Conflict
        {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{} {}", op.operation_type, op.status),
                to: SyncOperationStatus::InProgress.to_string(),
            });
        }
        let scenario_id = op
            .scenario_id
            .clone()
            .ok_or_else(|| SyncError::OperationNotFound(operation_id.to_string()))?;
        let guard: LockGuard = self
            .locks
            .acquire::<SyncError>(&[scenario_key(&scenario_id)], operation_id)?;

        let resumable = self.db.transaction(|conn| {
            let mut op = queries::get_sync_operation(conn, operation_id)?
                .ok_or_else(|| SyncError::OperationNotFound(operation_id.to_string()))?;
            let parked = queries::get_parked_payload(conn, operation_id)?.ok_or_else(|| {
                SyncError::InvalidStateTransition {
                    from: op.status.to_string(),
                    to: "resume without a fetched payload".into(),
                }
            })?;
            let base_sha = queries::get_sync_base(conn, &scenario_id)?.map(|b| b.commit_sha);
            if base_sha != parked.base_sha {
                return Err(SyncError::BaseMoved {
                    operation_id: operation_id.to_string(),
                    scenario_id: scenario_id.clone(),
                });
            }
            let recorded = queries::list_conflicts_for_operation(conn, operation_id)?;
            let open = recorded
                .iter()
                .filter(|c| c.resolution_status != ResolutionStatus::Resolved)
                .count();
            if open > 0 {
                return Err(SyncError::PendingConflicts {
                    scenario_id: scenario_id.clone(),
                    count: open,
                });
            }
            transition(&mut op, SyncOperationStatus::InProgress)?;
            queries::update_sync_operation(conn, &op)?;
            Ok::<_, SyncError>((op, parked, recorded))
        });
        let (mut op, parked, recorded) = match resumable {
            Ok(resumable) => resumable,
            Err(err @ SyncError::BaseMoved { .. }) => {
                // The fetched payload no longer applies; close the attempt.
                let mut stale = self.operation(operation_id)?;
                return Err(self.fail(&mut stale, err));
            }
            Err(err) => return Err(err),
        };
        info!(operation_id, user, resolutions = recorded.len(), "resuming sync");

        let branch_name = match self.graph.branch(&scenario_id) {
            Ok(branch) => branch.branch_name,
            Err(e) => return Err(self.fail(&mut op, e.into())),
        };
        let remote = RemoteSnapshot {
            commit_sha: parked.commit_sha,
            payload: parked.payload,
        };
        let outcome = self.reconcile(op, &branch_name, &remote, &recorded);
        drop(guard);
        outcome
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Publish the scenario's effective state on its branch. Refused while the
    /// scenario has unresolved conflicts or the remote moved since the last
    /// sync.
    pub async fn push(&self, scenario_id: &str, user: &str) -> Result<SyncOutcome, SyncError> {
        let scenario = self.writable_scenario(scenario_id)?;
        let branch_name = self.graph.branch(&scenario.id)?.branch_name;
        let (mut op, guard) = self.start(
            SyncOperationType::Push,
            user,
            Some(&scenario.id),
            scenario_key(&scenario.id),
        )?;

        // Checked under the scenario lock so no pull can park conflicts
        // between the check and the push.
        let outstanding = match self
            .db
            .read(|conn| queries::outstanding_conflicts_for_scenario(conn, &scenario.id))
        {
            Ok(outstanding) => outstanding,
            Err(e) => return Err(self.fail(&mut op, e.into())),
        };
        if !outstanding.is_empty() {
            warn!(scenario_id, count = outstanding.len(), "push refused: unresolved conflicts");
            let err = SyncError::PendingConflicts {
                scenario_id: scenario.id.clone(),
                count: outstanding.len(),
            };
            return Err(self.fail(&mut op, err));
        }
        let token = self.token_for(&mut op)?;

        let (local, base, payload) = self
            .prepare_push(&scenario.id, user)
            .map_err(|e| self.fail(&mut op, e))?;
        if let Some(base) = base.as_ref() {
            if base.snapshot.equivalent(&local) {
                let outcome = self.complete_without_changes(op, "nothing to push");
                drop(guard);
                return outcome;
            }
        }

        let request = PushRequest {
            branch: branch_name.clone(),
            expected_head: base.as_ref().map(|b| b.commit_sha.clone()),
            payload: payload.clone(),
            message: format!("Update scenario '{}' ({} entities)", scenario.name, local.len()),
            author_name: user.to_string(),
            author_email: self.git.author_email(user),
        };
        let sha = self
            .network(&mut op, "push", move |repo| {
                repo.push_snapshot(&request, Some(&token))
            })
            .await?;
        self.mark_used(&op);

        let empty = Snapshot::new();
        let previous = base.as_ref().map(|b| &b.snapshot).unwrap_or(&empty);
        let result = self.db.transaction(|conn| -> Result<SyncOutcome, SyncError> {
            let now = Utc::now();
            queries::upsert_sync_base(
                conn,
                &SyncBaseRow {
                    scenario_id: scenario.id.clone(),
                    branch_name: branch_name.clone(),
                    commit_sha: sha.clone(),
                    snapshot: payload.clone(),
                    synced_at: now,
                },
            )?;
            queries::touch_last_synced(conn, &scenario.id, &now)?;

            let diff = crate::diff::diff_snapshots(&scenario.id, &scenario.id, previous, &local);
            let message = format!("Push {branch_name} at {}", short(&sha));
            let entry = history::entry_for_diff(
                &scenario.id,
                Some(&op.id),
                user,
                &message,
                &diff,
                Some(sha.clone()),
                now,
            );
            let entry = history::record_in(conn, entry)?;

            transition(&mut op, SyncOperationStatus::Completed)?;
            queries::update_sync_operation(conn, &op)?;
            Ok(SyncOutcome {
                operation: op.clone(),
                conflicts: Vec::new(),
                history: Some(entry),
            })
        });
        let outcome = self.settle(&mut op, result);
        drop(guard);
        outcome
    }

    fn prepare_push(
        &self,
        scenario_id: &str,
        user: &str,
    ) -> Result<(Snapshot, Option<SyncBase>, String), SyncError> {
        let (local, base_row) = self.db.read(|conn| {
            let local = load_snapshot(conn, scenario_id, None, self.max_depth)?;
            let base = queries::get_sync_base(conn, scenario_id)?;
            Ok::<_, SyncError>((local, base))
        })?;
        let base = base_row.map(SyncBase::from_row).transpose()?;
        let payload = ScenarioExportData::from_snapshot(scenario_id, &local, user, Utc::now())
            .encode()?;
        Ok((local, base, payload))
    }

    // -----------------------------------------------------------------------
    // Shared steps
    // -----------------------------------------------------------------------

    fn writable_scenario(&self, scenario_id: &str) -> Result<Scenario, SyncError> {
        let scenario = self.graph.get(scenario_id)?;
        if scenario.is_archived() {
            return Err(ScenarioError::Archived(scenario.id).into());
        }
        Ok(scenario)
    }

    /// Lock, record the operation and move it to `in-progress`.
    fn start(
        &self,
        operation_type: SyncOperationType,
        user: &str,
        scenario_id: Option<&str>,
        lock_key: String,
    ) -> Result<(SyncOperation, LockGuard), SyncError> {
        let mut op =
            SyncOperation::begin(operation_type, user, scenario_id.map(str::to_string), None);
        let guard = self
            .locks
            .acquire::<SyncError>(&[lock_key], &op.id)
            .map_err(|err| {
                warn!(kind = %operation_type, user, error = %err, "sync refused");
                err
            })?;
        self.db.transaction(|conn| {
            queries::insert_sync_operation(conn, &op)?;
            transition(&mut op, SyncOperationStatus::InProgress)?;
            queries::update_sync_operation(conn, &op)?;
            Ok::<_, SyncError>(())
        })?;
        info!(
            operation_id = %op.id,
            kind = %operation_type,
            scenario_id = ?scenario_id,
            user,
            "sync started"
        );
        Ok((op, guard))
    }

    /// The caller's token for the configured repository. A missing or
    /// expired credential fails the operation before any network call.
    fn token_for(&self, op: &mut SyncOperation) -> Result<String, SyncError> {
        let url = &self.git.repository_url;
        let credential = match self.vault.credential_for(&op.user_id, url) {
            Ok(credential) => credential,
            Err(e) => return Err(self.fail(op, e.into())),
        };
        match credential {
            None => {
                let err = SyncError::CredentialMissing {
                    operation_id: op.id.clone(),
                    user_id: op.user_id.clone(),
                    repository_url: url.clone(),
                };
                Err(self.fail(op, err))
            }
            Some(credential) if credential.is_expired(Utc::now()) => {
                let err = SyncError::CredentialExpired {
                    operation_id: op.id.clone(),
                    user_id: op.user_id.clone(),
                    expired_at: credential
                        .expires_at
                        .as_ref()
                        .map(queries::ts)
                        .unwrap_or_default(),
                };
                Err(self.fail(op, err))
            }
            Some(credential) => Ok(credential.token),
        }
    }

    fn mark_used(&self, op: &SyncOperation) {
        if let Err(e) = self
            .vault
            .mark_used(&op.user_id, &self.git.repository_url, Utc::now())
        {
            warn!(operation_id = %op.id, error = %e, "failed to stamp credential use");
        }
    }

    /// Run one network leg on the blocking pool under the configured
    /// timeout. Failures mark the operation failed.
    async fn network<T, F>(
        &self,
        op: &mut SyncOperation,
        leg: &'static str,
        call: F,
    ) -> Result<T, SyncError>
    where
        F: FnOnce(&dyn Repository) -> Result<T, GitError> + Send + 'static,
        T: Send + 'static,
    {
        let repo = Arc::clone(&self.repo);
        let secs = self.git.network_timeout_secs;
        debug!(operation_id = %op.id, leg, timeout_secs = secs, "network leg");

        let task = tokio::task::spawn_blocking(move || call(repo.as_ref()));
        let result = match tokio::time::timeout(Duration::from_secs(secs), task).await {
            Ok(Ok(Ok(value))) => return Ok(value),
            Err(_) => Err(SyncError::NetworkUnavailable {
                operation_id: op.id.clone(),
                detail: format!("{leg} timed out after {secs}s"),
            }),
            Ok(Err(join)) => Err(SyncError::NetworkUnavailable {
                operation_id: op.id.clone(),
                detail: format!("{leg} did not finish: {join}"),
            }),
            Ok(Ok(Err(GitError::Network(detail)))) => Err(SyncError::NetworkUnavailable {
                operation_id: op.id.clone(),
                detail,
            }),
            Ok(Ok(Err(GitError::PushRejected { branch, .. }))) => Err(SyncError::RemoteAhead {
                operation_id: op.id.clone(),
                branch,
            }),
            Ok(Ok(Err(other))) => Err(SyncError::GitError(other)),
        };
        result.map_err(|e| self.fail(op, e))
    }

    /// Three-way merge of (state at last sync, local, fetched) on the
    /// operation's scenario. Commits, or parks the payload and stops in
    /// `conflict`.
    fn reconcile(
        &self,
        mut op: SyncOperation,
        branch_name: &str,
        remote: &RemoteSnapshot,
        recorded: &[Conflict],
    ) -> Result<SyncOutcome, SyncError> {
        let Some(scenario_id) = op.scenario_id.clone() else {
            let err = SyncError::OperationNotFound(op.id.clone());
            return Err(self.fail(&mut op, err));
        };
        let fetched = match ScenarioExportData::decode(&remote.payload)
            .and_then(|data| data.to_snapshot())
        {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.fail(&mut op, e.into())),
        };

        let result = self.db.transaction(|conn| -> Result<SyncOutcome, SyncError> {
            supersede_parked(conn, &scenario_id, &op)?;
            let (base_sha, base) = match queries::get_sync_base(conn, &scenario_id)? {
                Some(row) => {
                    let base = SyncBase::from_row(row)?;
                    (Some(base.commit_sha), base.snapshot)
                }
                None => (None, Snapshot::new()),
            };
            let local = load_snapshot(conn, &scenario_id, None, self.max_depth)?;
            let mut plan = merge::merge(&base, &local, &fetched);
            plan.apply_recorded(recorded);

            if !plan.is_clean() {
                let conflicts: Vec<Conflict> =
                    plan.conflicts.iter().map(|c| c.to_record(&op.id)).collect();
                for conflict in &conflicts {
                    queries::insert_conflict(conn, conflict)?;
                }
                queries::set_parked_payload(
                    conn,
                    &op.id,
                    Some(&ParkedPayload {
                        payload: remote.payload.clone(),
                        commit_sha: remote.commit_sha.clone(),
                        base_sha,
                    }),
                )?;
                transition(&mut op, SyncOperationStatus::Conflict)?;
                op.conflict_count = (recorded.len() + conflicts.len()) as i64;
                queries::update_sync_operation(conn, &op)?;
                return Ok(SyncOutcome {
                    operation: op.clone(),
                    conflicts,
                    history: None,
                });
            }

            let now = Utc::now();
            let diff = write_snapshot(conn, &scenario_id, &local, &plan.merged)?;
            queries::upsert_sync_base(
                conn,
                &SyncBaseRow {
                    scenario_id: scenario_id.clone(),
                    branch_name: branch_name.to_string(),
                    commit_sha: remote.commit_sha.clone(),
                    snapshot: remote.payload.clone(),
                    synced_at: now,
                },
            )?;
            queries::touch_last_synced(conn, &scenario_id, &now)?;
            queries::set_parked_payload(conn, &op.id, None)?;

            let history = if diff.is_empty() {
                None
            } else {
                let message = format!("Pull {branch_name} at {}", short(&remote.commit_sha));
                let entry = history::entry_for_diff(
                    &scenario_id,
                    Some(&op.id),
                    &op.user_id,
                    &message,
                    &diff,
                    Some(remote.commit_sha.clone()),
                    now,
                );
                Some(history::record_in(conn, entry)?)
            };
            transition(&mut op, SyncOperationStatus::Completed)?;
            queries::update_sync_operation(conn, &op)?;
            Ok(SyncOutcome {
                operation: op.clone(),
                conflicts: Vec::new(),
                history,
            })
        });
        self.settle(&mut op, result)
    }

    fn complete_without_changes(
        &self,
        mut op: SyncOperation,
        reason: &str,
    ) -> Result<SyncOutcome, SyncError> {
        debug!(operation_id = %op.id, reason, "sync completed without changes");
        let result = self.db.transaction(|conn| -> Result<SyncOutcome, SyncError> {
            transition(&mut op, SyncOperationStatus::Completed)?;
            queries::update_sync_operation(conn, &op)?;
            Ok(SyncOutcome {
                operation: op.clone(),
                conflicts: Vec::new(),
                history: None,
            })
        });
        self.settle(&mut op, result)
    }

    /// Log the end of an operation; a failed commit transaction fails it.
    fn settle(
        &self,
        op: &mut SyncOperation,
        result: Result<SyncOutcome, SyncError>,
    ) -> Result<SyncOutcome, SyncError> {
        match result {
            Ok(outcome) => {
                match outcome.operation.status {
                    SyncOperationStatus::Conflict => warn!(
                        operation_id = %outcome.operation.id,
                        conflicts = outcome.conflicts.len(),
                        "sync stopped on conflicts"
                    ),
                    status => info!(
                        operation_id = %outcome.operation.id,
                        status = %status,
                        commit_sha = ?outcome.history.as_ref().map(|h| h.commit_sha.as_str()),
                        "sync finished"
                    ),
                }
                Ok(outcome)
            }
            Err(e) => {
                // The transaction rolled back, so the stored row is still
                // in-progress whatever the in-memory copy says.
                op.status = SyncOperationStatus::InProgress;
                Err(self.fail(op, e))
            }
        }
    }

    /// Mark the operation failed with `err` as its message and hand the
    /// error back.
    fn fail(&self, op: &mut SyncOperation, err: SyncError) -> SyncError {
        if op.fail(err.to_string()) {
            let stored: &SyncOperation = op;
            if let Err(e) = self
                .db
                .transaction(|conn| queries::update_sync_operation(conn, stored))
            {
                warn!(operation_id = %op.id, error = %e, "could not record sync failure");
            }
        }
        warn!(
            operation_id = %op.id,
            kind = %op.operation_type,
            error = %err,
            "sync failed"
        );
        err
    }
}

/// The last synced remote state of a scenario.
struct SyncBase {
    commit_sha: String,
    snapshot: Snapshot,
}

impl SyncBase {
    fn from_row(row: SyncBaseRow) -> Result<Self, SyncError> {
        let snapshot = ScenarioExportData::decode(&row.snapshot)?.to_snapshot()?;
        Ok(Self {
            commit_sha: row.commit_sha,
            snapshot,
        })
    }
}

/// Fail every other pull or clone parked on the scenario. Only the newest
/// fetch may be reconciled; an older parked payload would roll local state
/// back to it.
fn supersede_parked(
    conn: &Connection,
    scenario_id: &str,
    current: &SyncOperation,
) -> Result<(), SyncError> {
    let parked = queries::parked_operations(conn, scenario_id)?;
    for mut stale in parked.into_iter().filter(|p| {
        p.id != current.id
            && matches!(
                p.operation_type,
                SyncOperationType::Pull | SyncOperationType::Clone
            )
    }) {
        if stale.fail(format!(
            "superseded by {} {}",
            current.operation_type, current.id
        )) {
            queries::update_sync_operation(conn, &stale)?;
            queries::set_parked_payload(conn, &stale.id, None)?;
            info!(
                operation_id = %stale.id,
                superseded_by = %current.id,
                "parked sync superseded"
            );
        }
    }
    Ok(())
}

fn transition(op: &mut SyncOperation, next: SyncOperationStatus) -> Result<(), SyncError> {
    if op.advance(next) {
        Ok(())
    } else {
        Err(SyncError::InvalidStateTransition {
            from: op.status.to_string(),
            to: next.to_string(),
        })
    }
}

fn short(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::DbCredentialVault;
    use crate::git::InMemoryRepository;
    use crate::models::GitCredential;

    const URL: &str = "https://git.example.com/plans.git";

    fn orchestrator() -> (Arc<Database>, Arc<InMemoryRepository>, SyncOrchestrator) {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let repo = Arc::new(InMemoryRepository::new());
        let vault = Arc::new(DbCredentialVault::new(Arc::clone(&db)));
        vault
            .store(&GitCredential {
                user_id: "alice".into(),
                provider: "github-enterprise".into(),
                credential_type: "personal-access-token".into(),
                token: "t0k3n".into(),
                repository_url: URL.into(),
                expires_at: None,
                created_at: Utc::now(),
                last_used_at: None,
            })
            .unwrap();
        let sync = SyncOrchestrator::new(
            Arc::clone(&db),
            repo.clone(),
            vault,
            GitConfig::for_url(URL),
            &MergeConfig::default(),
        );
        (db, repo, sync)
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }

    #[tokio::test]
    async fn test_clone_of_empty_remote_creates_baseline() {
        let (db, repo, sync) = orchestrator();
        let outcome = sync.clone_remote("alice").await.unwrap();
        assert_eq!(outcome.operation.status, SyncOperationStatus::Completed);
        // clone_remote + fetch of the default branch
        assert_eq!(repo.network_calls(), 2);

        let root = db.read(queries::find_root_baseline).unwrap().unwrap();
        assert_eq!(outcome.operation.scenario_id.as_deref(), Some(root.id.as_str()));
        assert!(queries::get_lock(&db.conn(), &repository_key(URL)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_credential_fails_without_network() {
        let (_db, repo, sync) = orchestrator();
        let err = sync.clone_remote("mallory").await.unwrap_err();
        let operation_id = match err {
            SyncError::CredentialMissing { operation_id, .. } => operation_id,
            other => panic!("expected CredentialMissing, got {other:?}"),
        };
        assert_eq!(repo.network_calls(), 0);
        let op = sync.operation(&operation_id).unwrap();
        assert_eq!(op.status, SyncOperationStatus::Failed);
        assert!(op.error_message.unwrap().contains("mallory"));
    }
}
