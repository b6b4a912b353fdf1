//! Merging a child scenario back into its parent.
//!
//! [`three_way`] is the pure field-level merge, [`lock`] serializes merges
//! and syncs per scenario, and [`coordinator`] drives a merge attempt from
//! lock acquisition to the all-or-nothing commit.

pub mod coordinator;
pub mod lock;
pub mod three_way;

pub use coordinator::{MergeCoordinator, MergeOutcome};
pub use lock::{repository_key, scenario_key, LockGuard, LockHeld, LockManager};
pub use three_way::{merge, FieldConflict, MergePlan, ENTITY_FIELD};
