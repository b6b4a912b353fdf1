//! Scenario graph manager: scenario records and the parent/child tree.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{queries, Database};
use crate::errors::ScenarioError;
use crate::git::branch::branch_name_for;
use crate::models::{BranchMetadata, MergeStatus, Scenario, ScenarioStatus, ScenarioType};

/// Request to create (branch) a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewScenario {
    /// `None` creates a root; only allowed for baselines.
    pub parent_id: Option<String>,
    pub scenario_type: ScenarioType,
    pub name: String,
    #[serde(default)]
    pub created_by: String,
}

impl NewScenario {
    pub fn root(name: &str, created_by: &str) -> Self {
        Self {
            parent_id: None,
            scenario_type: ScenarioType::Baseline,
            name: name.to_string(),
            created_by: created_by.to_string(),
        }
    }

    pub fn branch(
        parent_id: &str,
        scenario_type: ScenarioType,
        name: &str,
        created_by: &str,
    ) -> Self {
        Self {
            parent_id: Some(parent_id.to_string()),
            scenario_type,
            name: name.to_string(),
            created_by: created_by.to_string(),
        }
    }
}

/// The chain `scenario_id, parent, grandparent, ..., root` (nearest first).
///
/// Fails with `Cycle` if a scenario is revisited and with `Validation` if the
/// chain is deeper than `max_depth`.
pub fn ancestor_chain(
    conn: &Connection,
    scenario_id: &str,
    max_depth: usize,
) -> Result<Vec<Scenario>, ScenarioError> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut next = Some(scenario_id.to_string());

    while let Some(id) = next {
        if !visited.insert(id.clone()) {
            return Err(ScenarioError::Cycle { scenario_id: id });
        }
        if chain.len() >= max_depth {
            return Err(ScenarioError::Validation(format!(
                "scenario '{scenario_id}' is nested deeper than {max_depth} levels"
            )));
        }
        let scenario =
            queries::get_scenario(conn, &id)?.ok_or_else(|| ScenarioError::NotFound(id.clone()))?;
        next = scenario.parent_scenario_id.clone();
        chain.push(scenario);
    }
    Ok(chain)
}

pub struct ScenarioGraph {
    db: Arc<Database>,
    max_depth: usize,
    default_branch: String,
}

impl ScenarioGraph {
    pub fn new(db: Arc<Database>, max_depth: usize, default_branch: &str) -> Self {
        Self {
            db,
            max_depth,
            default_branch: default_branch.to_string(),
        }
    }

    /// Create a scenario, either as a root baseline or branched from an
    /// existing, non-archived parent. Records its branch metadata and the
    /// arena revision it branched at.
    pub fn create(&self, request: NewScenario) -> Result<Scenario, ScenarioError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ScenarioError::Validation("scenario name must not be empty".into()));
        }
        if request.parent_id.is_none() && request.scenario_type != ScenarioType::Baseline {
            return Err(ScenarioError::Validation(
                "only baseline scenarios may be created without a parent".into(),
            ));
        }
        let created_by = if request.created_by.trim().is_empty() {
            "anonymous".to_string()
        } else {
            request.created_by.clone()
        };

        let scenario = self.db.transaction(|conn| {
            let id = Uuid::new_v4().to_string();
            let parent = match request.parent_id.as_deref() {
                Some(parent_id) => Some(self.check_parent(conn, parent_id, &id)?),
                None => None,
            };
            let parent_branch = match parent.as_ref() {
                Some(p) => queries::get_branch(conn, &p.id)?.map(|b| b.branch_name),
                None => None,
            };

            let now = Utc::now();
            let scenario = Scenario {
                id: id.clone(),
                name: name.clone(),
                scenario_type: request.scenario_type,
                status: if parent.is_none() {
                    ScenarioStatus::Active
                } else {
                    ScenarioStatus::Draft
                },
                parent_scenario_id: parent.as_ref().map(|p| p.id.clone()),
                branched_at_revision: queries::max_revision(conn)?,
                created_by: created_by.clone(),
                created_at: now,
                updated_at: now,
            };
            queries::insert_scenario(conn, &scenario)?;

            let branch_name = if parent.is_none()
                && !queries::branch_name_taken(conn, &self.default_branch)?
            {
                self.default_branch.clone()
            } else {
                branch_name_for(&name, &id)
            };
            queries::insert_branch(
                conn,
                &BranchMetadata {
                    scenario_id: id.clone(),
                    branch_name,
                    parent_branch,
                    created_by: created_by.clone(),
                    created_at: now,
                    merge_status: MergeStatus::Unmerged,
                    last_synced_at: None,
                },
            )?;
            Ok::<_, ScenarioError>(scenario)
        })?;

        info!(
            scenario_id = %scenario.id,
            parent_id = ?scenario.parent_scenario_id,
            scenario_type = %scenario.scenario_type,
            "scenario created"
        );
        Ok(scenario)
    }

    fn check_parent(
        &self,
        conn: &Connection,
        parent_id: &str,
        new_id: &str,
    ) -> Result<Scenario, ScenarioError> {
        let parent = queries::get_scenario(conn, parent_id)?.ok_or_else(|| {
            ScenarioError::InvalidParent {
                parent_id: parent_id.to_string(),
                reason: "parent scenario does not exist".into(),
            }
        })?;
        if parent.is_archived() {
            return Err(ScenarioError::InvalidParent {
                parent_id: parent_id.to_string(),
                reason: "parent scenario is archived".into(),
            });
        }
        let chain = ancestor_chain(conn, parent_id, self.max_depth)?;
        if chain.iter().any(|s| s.id == new_id) {
            return Err(ScenarioError::Cycle {
                scenario_id: new_id.to_string(),
            });
        }
        if chain.len() + 1 > self.max_depth {
            return Err(ScenarioError::Validation(format!(
                "branching from '{parent_id}' would exceed the maximum depth of {}",
                self.max_depth
            )));
        }
        Ok(parent)
    }

    pub fn get(&self, id: &str) -> Result<Scenario, ScenarioError> {
        self.db
            .read(|conn| queries::get_scenario(conn, id))?
            .ok_or_else(|| ScenarioError::NotFound(id.to_string()))
    }

    pub fn list(&self, include_archived: bool) -> Result<Vec<Scenario>, ScenarioError> {
        Ok(self
            .db
            .read(|conn| queries::list_scenarios(conn, include_archived))?)
    }

    pub fn children(&self, id: &str) -> Result<Vec<Scenario>, ScenarioError> {
        self.get(id)?;
        Ok(self.db.read(|conn| queries::child_scenarios(conn, id))?)
    }

    /// Promote a draft to active. Already-active scenarios are returned as-is.
    pub fn activate(&self, id: &str) -> Result<Scenario, ScenarioError> {
        let scenario = self.db.transaction(|conn| {
            let mut scenario = queries::get_scenario(conn, id)?
                .ok_or_else(|| ScenarioError::NotFound(id.to_string()))?;
            match scenario.status {
                ScenarioStatus::Archived => return Err(ScenarioError::Archived(id.to_string())),
                ScenarioStatus::Active => return Ok(scenario),
                ScenarioStatus::Draft => {}
            }
            let now = Utc::now();
            queries::update_scenario_status(conn, id, ScenarioStatus::Active, &now)?;
            scenario.status = ScenarioStatus::Active;
            scenario.updated_at = now;
            Ok(scenario)
        })?;
        info!(scenario_id = %id, "scenario activated");
        Ok(scenario)
    }

    /// Soft-archive a scenario that has no live children. Its branch is
    /// marked abandoned unless it was already merged.
    pub fn archive(&self, id: &str) -> Result<Scenario, ScenarioError> {
        let scenario = self.db.transaction(|conn| {
            let mut scenario = queries::get_scenario(conn, id)?
                .ok_or_else(|| ScenarioError::NotFound(id.to_string()))?;
            if scenario.is_archived() {
                return Ok(scenario);
            }
            let live = queries::count_live_children(conn, id)?;
            if live > 0 {
                return Err(ScenarioError::HasActiveChildren {
                    scenario_id: id.to_string(),
                    count: live,
                });
            }
            let now = Utc::now();
            queries::update_scenario_status(conn, id, ScenarioStatus::Archived, &now)?;
            if let Some(branch) = queries::get_branch(conn, id)? {
                if branch.merge_status == MergeStatus::Unmerged {
                    queries::update_merge_status(conn, id, MergeStatus::Abandoned)?;
                }
            }
            scenario.status = ScenarioStatus::Archived;
            scenario.updated_at = now;
            Ok(scenario)
        })?;
        info!(scenario_id = %id, "scenario archived");
        Ok(scenario)
    }

    /// Ancestors of `id`, nearest first (the scenario itself excluded).
    pub fn ancestors_of(&self, id: &str) -> Result<Vec<Scenario>, ScenarioError> {
        let mut chain = self
            .db
            .read(|conn| ancestor_chain(conn, id, self.max_depth))?;
        chain.remove(0);
        Ok(chain)
    }

    /// Nearest scenario that is an ancestor-or-self of both `a` and `b`.
    pub fn nearest_common_ancestor(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<Scenario>, ScenarioError> {
        let (chain_a, chain_b) = self.db.read(|conn| {
            let chain_a = ancestor_chain(conn, a, self.max_depth)?;
            let chain_b = ancestor_chain(conn, b, self.max_depth)?;
            Ok::<_, ScenarioError>((chain_a, chain_b))
        })?;
        let seen: HashSet<&str> = chain_a.iter().map(|s| s.id.as_str()).collect();
        Ok(chain_b.into_iter().find(|s| seen.contains(s.id.as_str())))
    }

    /// Check that no scenario is its own ancestor.
    pub fn verify_acyclic(&self) -> Result<(), ScenarioError> {
        self.db.read(|conn| {
            for scenario in queries::list_scenarios(conn, true)? {
                if let Err(err) = ancestor_chain(conn, &scenario.id, self.max_depth) {
                    warn!(scenario_id = %scenario.id, error = %err, "hierarchy check failed");
                    return Err(err);
                }
            }
            Ok(())
        })
    }

    /// Branch metadata of a scenario.
    pub fn branch(&self, id: &str) -> Result<BranchMetadata, ScenarioError> {
        self.db
            .read(|conn| queries::get_branch(conn, id))?
            .ok_or_else(|| ScenarioError::NotFound(id.to_string()))
    }
}
