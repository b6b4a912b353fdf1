//! Domain model types used throughout ScenarioSync.
//!
//! These types bridge the scenario graph, the merge engine, the database
//! layer and the web API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DatabaseError;

/// Generates `Display`/`FromStr`/`as_str` for a fieldless enum with fixed
/// string forms that are shared by the database and the JSON API.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// The canonical string form stored in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DatabaseError::InvalidColumn {
                        column: stringify!($name).to_string(),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// Kind of planning scenario.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioType {
    Custom,
    Baseline,
    Optimistic,
    Pessimistic,
    WhatIf,
    Forecast,
}

string_enum!(ScenarioType {
    Custom => "custom",
    Baseline => "baseline",
    Optimistic => "optimistic",
    Pessimistic => "pessimistic",
    WhatIf => "what-if",
    Forecast => "forecast",
});

/// Lifecycle status of a scenario.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Draft,
    Active,
    Archived,
}

string_enum!(ScenarioStatus {
    Draft => "draft",
    Active => "active",
    Archived => "archived",
});

/// A node in the scenario tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub scenario_type: ScenarioType,
    pub status: ScenarioStatus,
    /// `None` only for a root baseline.
    pub parent_scenario_id: Option<String>,
    /// Highest entity-version revision that existed when the scenario was
    /// branched; the parent's state at branch time is the fold of its chain
    /// up to this revision.
    pub branched_at_revision: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scenario {
    pub fn is_archived(&self) -> bool {
        self.status == ScenarioStatus::Archived
    }

    pub fn is_root(&self) -> bool {
        self.parent_scenario_id.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tracked entities
// ---------------------------------------------------------------------------

/// The closed set of entity types the merge engine understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    Person,
    Assignment,
    ProjectPhase,
}

string_enum!(EntityType {
    Project => "project",
    Person => "person",
    Assignment => "assignment",
    ProjectPhase => "project_phase",
});

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Project,
        EntityType::Person,
        EntityType::Assignment,
        EntityType::ProjectPhase,
    ];

    /// Name of the collection holding this type in `ScenarioExportData`.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Project => "projects",
            Self::Person => "people",
            Self::Assignment => "assignments",
            Self::ProjectPhase => "projectPhases",
        }
    }
}

/// What happened to an entity within one change-set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Created,
    Updated,
    Deleted,
}

string_enum!(EntityAction {
    Created => "created",
    Updated => "updated",
    Deleted => "deleted",
});

/// One entity touched by a committed change-set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: EntityAction,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Resolution status of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Detected, nobody acted on it yet.
    Pending,
    /// A resolution value has been chosen.
    Resolved,
    /// A human explicitly postponed it; still blocks commit.
    Deferred,
}

string_enum!(ResolutionStatus {
    Pending => "pending",
    Resolved => "resolved",
    Deferred => "deferred",
});

/// A field where local and remote diverged from base in different ways.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    pub id: String,
    pub sync_operation_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: Option<String>,
    /// Field name, or [`crate::merge::ENTITY_FIELD`] for a whole-row
    /// presence conflict (edit versus delete).
    pub field: String,
    pub base_value: serde_json::Value,
    pub local_value: serde_json::Value,
    pub remote_value: serde_json::Value,
    pub resolution_status: ResolutionStatus,
    pub resolved_value: Option<serde_json::Value>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sync operations
// ---------------------------------------------------------------------------

/// Kind of sync operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperationType {
    Clone,
    Pull,
    Push,
    Merge,
}

string_enum!(SyncOperationType {
    Clone => "clone",
    Pull => "pull",
    Push => "push",
    Merge => "merge",
});

/// Status of a sync operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Conflict,
}

string_enum!(SyncOperationStatus {
    Pending => "pending",
    InProgress => "in-progress",
    Completed => "completed",
    Failed => "failed",
    Conflict => "conflict",
});

impl SyncOperationStatus {
    /// Whether `self -> next` is an allowed transition.
    ///
    /// `conflict -> in-progress` is the explicit retry/resume path; every
    /// other terminal state is final.
    pub fn can_transition_to(&self, next: SyncOperationStatus) -> bool {
        use SyncOperationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Conflict)
                | (Conflict, InProgress)
                | (Conflict, Failed)
        )
    }

    /// Whether the operation is still live (holds or may take a lock).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One attempt at clone/pull/push/merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOperation {
    pub id: String,
    pub operation_type: SyncOperationType,
    pub status: SyncOperationStatus,
    /// Scenario the operation acts on (the child for merges).
    pub scenario_id: Option<String>,
    /// Scenario that receives writes (the parent for merges).
    pub target_scenario_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub conflict_count: i64,
    pub error_message: Option<String>,
    pub user_id: String,
}

impl SyncOperation {
    /// A new `pending` operation with a fresh id.
    pub fn begin(
        operation_type: SyncOperationType,
        user_id: &str,
        scenario_id: Option<String>,
        target_scenario_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type,
            status: SyncOperationStatus::Pending,
            scenario_id,
            target_scenario_id,
            started_at: Utc::now(),
            completed_at: None,
            conflict_count: 0,
            error_message: None,
            user_id: user_id.to_string(),
        }
    }

    /// Move to `next`, stamping `completed_at` on terminal states. Returns
    /// `false` (and leaves the operation untouched) when not allowed.
    pub fn advance(&mut self, next: SyncOperationStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.completed_at = match next {
            SyncOperationStatus::Completed | SyncOperationStatus::Failed => Some(Utc::now()),
            _ => None,
        };
        true
    }

    /// Mark the operation failed with `message`, if it is still open.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if !self.advance(SyncOperationStatus::Failed) {
            return false;
        }
        self.error_message = Some(message.into());
        true
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// A token credential for the git remote.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct GitCredential {
    pub user_id: String,
    pub provider: String,
    pub credential_type: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub repository_url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl GitCredential {
    /// An expired credential is equivalent to having none.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

impl fmt::Debug for GitCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCredential")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("credential_type", &self.credential_type)
            .field("token", &"<redacted>")
            .field("repository_url", &self.repository_url)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Branch metadata
// ---------------------------------------------------------------------------

/// Merge state of a scenario branch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Unmerged,
    Merged,
    Abandoned,
}

string_enum!(MergeStatus {
    Unmerged => "unmerged",
    Merged => "merged",
    Abandoned => "abandoned",
});

/// A scenario's branch identity in the git-backed representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchMetadata {
    pub scenario_id: String,
    pub branch_name: String,
    pub parent_branch: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub merge_status: MergeStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Change history
// ---------------------------------------------------------------------------

/// Added/removed field-value counts of a change-set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: u64,
    pub removed: u64,
}

/// An immutable record of one committed change-set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeHistoryEntry {
    /// Row id once recorded.
    pub id: Option<i64>,
    pub commit_sha: String,
    pub scenario_id: String,
    pub sync_operation_id: Option<String>,
    pub author: String,
    pub author_name: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub files_changed: Vec<String>,
    pub entities_affected: Vec<EntityRef>,
    pub diff_summary: DiffSummary,
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// A page of results, newest first, with a cursor for the next page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!(ScenarioType::WhatIf.to_string(), "what-if");
        assert_eq!("what-if".parse::<ScenarioType>().unwrap(), ScenarioType::WhatIf);
        assert_eq!(SyncOperationStatus::InProgress.as_str(), "in-progress");
        assert_eq!(EntityType::ProjectPhase.collection(), "projectPhases");
        assert!("bogus".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use SyncOperationStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Conflict));
        assert!(Conflict.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_operation_advance_and_fail() {
        let mut op = SyncOperation::begin(SyncOperationType::Pull, "alice", None, None);
        assert_eq!(op.status, SyncOperationStatus::Pending);
        assert!(!op.advance(SyncOperationStatus::Completed));
        assert!(op.advance(SyncOperationStatus::InProgress));
        assert!(op.advance(SyncOperationStatus::Conflict));
        assert!(op.completed_at.is_none());
        assert!(op.fail("abandoned"));
        assert!(op.completed_at.is_some());
        assert_eq!(op.error_message.as_deref(), Some("abandoned"));
        assert!(!op.fail("again"));
    }

    #[test]
    fn test_credential_expiry_and_redaction() {
        let now = Utc::now();
        let mut cred = GitCredential {
            user_id: "alice".into(),
            provider: "github-enterprise".into(),
            credential_type: "personal_access_token".into(),
            token: "ghp_secret".into(),
            repository_url: "https://git.example.com/plan.git".into(),
            expires_at: Some(now - Duration::minutes(1)),
            created_at: now,
            last_used_at: None,
        };
        assert!(cred.is_expired(now));
        cred.expires_at = None;
        assert!(!cred.is_expired(now));

        let debug = format!("{:?}", cred);
        assert!(!debug.contains("ghp_secret"));
        let json = serde_json::to_string(&cred).unwrap();
        assert!(!json.contains("ghp_secret"));
    }
}
