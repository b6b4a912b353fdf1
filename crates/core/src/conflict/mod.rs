//! Conflict records produced by merges and pulls, and their resolution.
//!
//! Conflicts are detected by the three-way merge in [`crate::merge`]; this
//! module only tracks what a human decided for each of them.

pub mod resolver;

pub use resolver::{ConflictResolver, ResolutionStrategy};
