//! arbor core library.
//!
//! Git-style version control over structured data: content-addressed
//! blob/tree/commit storage, branches with per-branch locking, merge-base
//! resolution, three-way conflict classification with dependency-aware
//! severity, and a merge engine with pluggable strategies. Persistence is
//! pluggable through [`backend::Backend`]; an in-memory and a SQLite backend
//! are provided.

pub mod ancestry;
pub mod backend;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod db;
pub mod deps;
pub mod digest;
pub mod errors;
pub mod merge;
pub mod models;
pub mod refs;
pub mod repository;
pub mod store;

// Re-exports for convenience.
pub use config::ArborConfig;
pub use conflict::{Conflict, ConflictKind, Resolution, Severity};
pub use db::Database;
pub use digest::Digest;
pub use errors::CoreError;
pub use models::{Branch, Commit, MergeOperation, MergeStatus, MergeStrategy, Signature, TreeEntry};
pub use repository::Repository;
pub use store::TreeBuilder;
