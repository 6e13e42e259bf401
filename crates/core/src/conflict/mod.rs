//! Conflict classification and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Classification** -- three-way comparison of source and target trees
//!    against their merge base, with severity raised by dependency edges.
//! 2. **Combining** -- additive line-level merges for the `union` strategy.
//! 3. **Resolution** -- applying a merge strategy or caller choices and
//!    building the merged tree.

pub mod classifier;
pub mod merger;
pub mod resolver;

pub use classifier::{Conflict, ConflictClassifier, ConflictKind, Severity};
pub use merger::Merger;
pub use resolver::{auto_resolution, check_resolution, ConflictResolver, Resolution, StrategyOutcome};
