//! In-memory [`Repository`] fake for tests and local experimentation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::{PushRequest, RemoteSnapshot, Repository};
use crate::errors::GitError;

#[derive(Debug, Clone)]
struct Commit {
    sha: String,
    payload: String,
    message: String,
}

/// A remote that lives in process memory. Every trait call counts as one
/// network call, and the whole remote can be switched offline.
#[derive(Default)]
pub struct InMemoryRepository {
    branches: Mutex<HashMap<String, Vec<Commit>>>,
    network_calls: AtomicUsize,
    offline: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trait calls made so far.
    pub fn network_calls(&self) -> usize {
        self.network_calls.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every call sleep before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = delay;
        }
    }

    /// Put a commit on `branch` directly (not counted as a network call),
    /// as if another client had pushed it. Returns the new head.
    pub fn seed_branch(&self, branch: &str, payload: &str, message: &str) -> String {
        let mut branches = self.branches.lock().unwrap_or_else(|p| p.into_inner());
        let history = branches.entry(branch.to_string()).or_default();
        let parent = history.last().map(|c| c.sha.clone());
        let sha = commit_sha(branch, parent.as_deref(), payload, message);
        history.push(Commit {
            sha: sha.clone(),
            payload: payload.to_string(),
            message: message.to_string(),
        });
        sha
    }

    /// Current head of `branch`.
    pub fn head(&self, branch: &str) -> Option<RemoteSnapshot> {
        let branches = self.branches.lock().unwrap_or_else(|p| p.into_inner());
        branches
            .get(branch)
            .and_then(|h| h.last())
            .map(|c| RemoteSnapshot {
                commit_sha: c.sha.clone(),
                payload: c.payload.clone(),
            })
    }

    /// Commit messages on `branch`, oldest first.
    pub fn log(&self, branch: &str) -> Vec<String> {
        let branches = self.branches.lock().unwrap_or_else(|p| p.into_inner());
        branches
            .get(branch)
            .map(|h| h.iter().map(|c| c.message.clone()).collect())
            .unwrap_or_default()
    }

    fn network_leg(&self) -> Result<(), GitError> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(GitError::Network("remote unreachable".into()));
        }
        Ok(())
    }
}

fn commit_sha(branch: &str, parent: Option<&str>, payload: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(branch.as_bytes());
    hasher.update([0]);
    hasher.update(parent.unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(payload.as_bytes());
    hasher.update([0]);
    hasher.update(message.as_bytes());
    hex::encode(&hasher.finalize()[..20])
}

impl Repository for InMemoryRepository {
    fn clone_remote(&self, _url: &str, _token: Option<&str>) -> Result<(), GitError> {
        self.network_leg()
    }

    fn fetch_snapshot(
        &self,
        branch: &str,
        _token: Option<&str>,
    ) -> Result<Option<RemoteSnapshot>, GitError> {
        self.network_leg()?;
        Ok(self.head(branch))
    }

    fn push_snapshot(
        &self,
        request: &PushRequest,
        _token: Option<&str>,
    ) -> Result<String, GitError> {
        self.network_leg()?;
        let current = self.head(&request.branch).map(|s| s.commit_sha);
        if current != request.expected_head {
            return Err(GitError::PushRejected {
                branch: request.branch.clone(),
                detail: "remote head moved".into(),
            });
        }
        Ok(self.seed_branch(&request.branch, &request.payload, &request.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_calls_and_goes_offline() {
        let repo = InMemoryRepository::new();
        repo.seed_branch("main", "{}", "init");
        assert_eq!(repo.network_calls(), 0);

        assert!(repo.fetch_snapshot("main", None).unwrap().is_some());
        assert!(repo.fetch_snapshot("other", None).unwrap().is_none());
        assert_eq!(repo.network_calls(), 2);

        repo.set_offline(true);
        assert!(matches!(
            repo.fetch_snapshot("main", None),
            Err(GitError::Network(_))
        ));
        assert_eq!(repo.network_calls(), 3);
    }

    #[test]
    fn test_push_is_compare_and_swap() {
        let repo = InMemoryRepository::new();
        let head = repo.seed_branch("main", "{}", "init");
        let request = PushRequest {
            branch: "main".into(),
            expected_head: None,
            payload: "{\"a\":1}".into(),
            message: "push".into(),
            author_name: "alice".into(),
            author_email: "alice@example.com".into(),
        };
        assert!(matches!(
            repo.push_snapshot(&request, None),
            Err(GitError::PushRejected { .. })
        ));

        let request = PushRequest {
            expected_head: Some(head),
            ..request
        };
        let sha = repo.push_snapshot(&request, None).unwrap();
        assert_eq!(repo.head("main").unwrap().commit_sha, sha);
        assert_eq!(repo.log("main"), vec!["init", "push"]);
    }
}
