//! Git backends for scenario sync.
//!
//! Each scenario branch holds a single `scenario.json` file containing the
//! scenario's `ScenarioExportData`. The orchestrator talks to the remote only
//! through the [`Repository`] trait.

pub mod branch;
pub mod client;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::errors::GitError;

pub use client::Git2Repository;
pub use memory::InMemoryRepository;

/// File that carries the scenario payload on every branch.
pub const SNAPSHOT_FILE: &str = "scenario.json";

/// Head of a remote branch and the payload it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub commit_sha: String,
    pub payload: String,
}

/// A compare-and-swap push of one payload onto a branch.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub branch: String,
    /// The remote head the caller last saw (`None`: branch must not exist).
    pub expected_head: Option<String>,
    pub payload: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
}

/// Network-facing git operations. Implementations are blocking; the
/// orchestrator runs them on the blocking pool under a timeout.
pub trait Repository: Send + Sync {
    /// Create or refresh the local mirror of `url`.
    fn clone_remote(&self, url: &str, token: Option<&str>) -> Result<(), GitError>;

    /// Fetch `branch`; `None` when the remote has no such branch.
    fn fetch_snapshot(
        &self,
        branch: &str,
        token: Option<&str>,
    ) -> Result<Option<RemoteSnapshot>, GitError>;

    /// Commit `payload` on top of `expected_head` and push it. Fails with
    /// [`GitError::PushRejected`] when the remote head differs.
    fn push_snapshot(&self, request: &PushRequest, token: Option<&str>)
        -> Result<String, GitError>;
}
