//! Error types for the arbor core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::digest::Digest;
use crate::models::{ObjectKind, MergeOperation};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Ancestry(#[from] AncestryError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Object store errors
// ---------------------------------------------------------------------------

/// Errors from the content-addressed object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object of the given kind is stored under the digest.
    #[error("{kind} {digest} not found")]
    ObjectNotFound { kind: ObjectKind, digest: Digest },

    /// A tree entry points at an object that does not exist.
    #[error("tree entry '{name}' references missing {kind} {digest}")]
    DanglingReference {
        name: String,
        kind: ObjectKind,
        digest: Digest,
    },

    /// A tree entry name is empty, contains '/', or is duplicated.
    #[error("invalid tree entry name '{0}'")]
    InvalidEntryName(String),

    /// A stored object could not be decoded or failed its digest check.
    #[error("corrupt object {digest}: {detail}")]
    Corrupt { digest: Digest, detail: String },

    /// The persistence backend failed.
    #[error("object store backend error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the persistence backends.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A row could not be encoded or decoded.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value is not in the expected format.
    #[error("invalid {entity} row '{id}': {detail}")]
    InvalidRow {
        entity: String,
        id: String,
        detail: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Branch errors
// ---------------------------------------------------------------------------

/// Errors from the branch/ref manager.
#[derive(Debug, Error)]
pub enum BranchError {
    /// A live branch with this name already exists.
    #[error("branch '{0}' already exists")]
    AlreadyExists(String),

    /// No live branch with this name exists.
    #[error("branch '{0}' not found")]
    NotFound(String),

    /// The branch name is not acceptable.
    #[error("invalid branch name '{0}'")]
    InvalidName(String),

    /// The default branch cannot be deleted.
    #[error("branch '{0}' is the default branch and cannot be deleted")]
    DefaultBranchProtected(String),

    /// The per-branch lock could not be acquired in time. Retryable.
    #[error("timed out after {waited_ms}ms waiting for lock on branch '{branch}'")]
    LockTimeout { branch: String, waited_ms: u64 },

    /// The branch head moved while an update was being prepared.
    #[error("branch '{branch}' head moved: expected {expected}, found {actual}")]
    StaleHead {
        branch: String,
        expected: Digest,
        actual: Digest,
    },

    /// Underlying object store error.
    #[error("branch store error: {0}")]
    Store(#[from] StoreError),
}

impl From<DatabaseError> for BranchError {
    fn from(err: DatabaseError) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

// ---------------------------------------------------------------------------
// Ancestry errors
// ---------------------------------------------------------------------------

/// Errors from merge-base resolution.
#[derive(Debug, Error)]
pub enum AncestryError {
    /// Traversal exceeded the configured bound; the commit graph is corrupt.
    #[error("cyclic ancestry detected at commit {digest} (traversal limit {limit})")]
    CyclicAncestry { digest: Digest, limit: usize },

    /// The two commits share no ancestor.
    #[error("commits {a} and {b} have no common ancestor")]
    NoCommonAncestor { a: Digest, b: Digest },

    /// Underlying object store error.
    #[error("ancestry store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the merge engine.
///
/// [`MergeError::MergeAborted`] and [`MergeError::UnresolvedConflicts`] are
/// expected outcomes: the boxed operation carries the conflict list so the
/// caller can retry with another strategy or resolve manually.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Source and target are the same branch.
    #[error("cannot merge branch '{0}' into itself")]
    SelfMerge(String),

    /// Blocking conflicts were found under `abort_on_conflict`.
    #[error("merge of '{}' into '{}' aborted: {} conflict(s)", .0.source, .0.target, .0.conflicts.len())]
    MergeAborted(Box<MergeOperation>),

    /// The strategy left conflicts that need manual resolution.
    #[error("merge of '{}' into '{}' left {} unresolved conflict(s)", .0.source, .0.target, .0.pending_count())]
    UnresolvedConflicts(Box<MergeOperation>),

    /// A resolution would delete an object that other objects still depend on.
    #[error("deleting '{path}' ({digest}) would break {} dependent object(s)", .dependents.len())]
    DependencyViolation {
        path: String,
        digest: Digest,
        dependents: Vec<Digest>,
    },

    /// The merge state machine was driven through an illegal transition.
    #[error("invalid merge state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// `complete_manual` was called on an operation that is not pending.
    #[error("merge operation {id} is {status}, not manual_pending")]
    NotPending { id: String, status: String },

    /// A manual resolution names a path that has no conflict.
    #[error("no conflict at path '{0}' in this merge")]
    UnknownConflictPath(String),

    /// The merged tree could not be built because a differing path has no
    /// resolution.
    #[error("no resolution recorded for conflicting path '{0}'")]
    MissingResolution(String),

    /// Underlying branch error.
    #[error("merge branch error: {0}")]
    Branch(#[from] BranchError),

    /// Underlying ancestry error.
    #[error("merge ancestry error: {0}")]
    Ancestry(#[from] AncestryError),

    /// Underlying object store error.
    #[error("merge store error: {0}")]
    Store(#[from] StoreError),
}

impl From<DatabaseError> for MergeError {
    fn from(err: DatabaseError) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
