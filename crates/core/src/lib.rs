//! ScenarioSync core library.
//!
//! This crate provides the foundational components for branching planning
//! scenarios and merging them back: configuration, database persistence, the
//! copy-on-write entity store, the scenario graph, diffing, three-way merge
//! with conflict resolution, change history, export/import and git-backed
//! sync.

pub mod config;
pub mod conflict;
pub mod credentials;
pub mod db;
pub mod diff;
pub mod errors;
pub mod export;
pub mod git;
pub mod history;
pub mod merge;
pub mod models;
pub mod scenario;
pub mod store;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::AppConfig;
pub use conflict::{ConflictResolver, ResolutionStrategy};
pub use credentials::{CredentialVault, DbCredentialVault};
pub use db::Database;
pub use diff::{Diff, DiffEngine};
pub use export::{ScenarioExportData, ScenarioExporter};
pub use history::ChangeHistoryLog;
pub use merge::{MergeCoordinator, MergeOutcome};
pub use scenario::{NewScenario, ScenarioGraph};
pub use store::{EntityEdit, EntityStore, Snapshot};
pub use sync_engine::{SyncOrchestrator, SyncOutcome};
