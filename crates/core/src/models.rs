//! Domain model types: objects, branches, dependency edges and merge records.
//!
//! Objects reference each other only through [`Digest`] keys, never through
//! in-memory pointers. Trees and commits have a canonical byte encoding that
//! feeds the digest; the JSON form produced by `serde` is only a storage
//! format.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::{Conflict, Resolution};
use crate::digest::Digest;

// ---------------------------------------------------------------------------
// Object kinds
// ---------------------------------------------------------------------------

/// The three logical object stores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of object a tree entry points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Blob,
    Tree,
}

impl EntryKind {
    /// Default mode for entries of this kind.
    pub fn default_mode(&self) -> u32 {
        match self {
            Self::Blob => TreeEntry::MODE_BLOB,
            Self::Tree => TreeEntry::MODE_TREE,
        }
    }

    pub fn object_kind(&self) -> ObjectKind {
        match self {
            Self::Blob => ObjectKind::Blob,
            Self::Tree => ObjectKind::Tree,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.object_kind().as_str())
    }
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

/// One named slot in a [`Tree`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub target: Digest,
}

impl TreeEntry {
    pub const MODE_BLOB: u32 = 0o100644;
    pub const MODE_TREE: u32 = 0o040000;

    /// Entry pointing at a blob with the default mode.
    pub fn blob(name: impl Into<String>, target: Digest) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Blob,
            mode: Self::MODE_BLOB,
            target,
        }
    }

    /// Entry pointing at a subtree.
    pub fn tree(name: impl Into<String>, target: Digest) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Tree,
            mode: Self::MODE_TREE,
            target,
        }
    }

    pub fn is_tree(&self) -> bool {
        self.kind == EntryKind::Tree
    }
}

/// An ordered set of entries, sorted by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries in any order.
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical encoding: one `"<mode> <kind> <digest>\t<name>\n"` line per
    /// entry, in name order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 96);
        for e in &self.entries {
            out.extend_from_slice(
                format!("{:06o} {} {}\t{}\n", e.mode, e.kind, e.target, e.name).as_bytes(),
            );
        }
        out
    }

    pub fn digest(&self) -> Digest {
        Digest::of_object(ObjectKind::Tree.as_str(), &self.canonical_bytes())
    }
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// Commit author identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// An immutable snapshot of a tree with its history links.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commit {
    pub digest: Digest,
    pub tree: Digest,
    pub parents: Vec<Digest>,
    pub author: Signature,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    /// Build a commit and compute its digest.
    pub fn new(
        tree: Digest,
        parents: Vec<Digest>,
        author: Signature,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let message = message.into();
        let digest = Self::compute_digest(&tree, &parents, &author, &message, &timestamp);
        Self {
            digest,
            tree,
            parents,
            author,
            message,
            timestamp,
        }
    }

    fn compute_digest(
        tree: &Digest,
        parents: &[Digest],
        author: &Signature,
        message: &str,
        timestamp: &DateTime<Utc>,
    ) -> Digest {
        let mut body = format!("tree {tree}\n");
        for p in parents {
            body.push_str(&format!("parent {p}\n"));
        }
        body.push_str(&format!("author {author}\n"));
        body.push_str(&format!(
            "timestamp {}\n\n",
            timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ));
        body.push_str(message);
        Digest::of_object(ObjectKind::Commit.as_str(), body.as_bytes())
    }

    /// Recompute the digest from the commit's fields.
    pub fn recompute_digest(&self) -> Digest {
        Self::compute_digest(
            &self.tree,
            &self.parents,
            &self.author,
            &self.message,
            &self.timestamp,
        )
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

/// Lifecycle status of a branch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Merged,
    Deleted,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Deleted => "deleted",
        }
    }

    /// Parse a stored status string.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "merged" => Some(Self::Merged),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, mutable pointer to a commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Branch {
    pub name: String,
    pub head: Digest,
    /// Branch this one was forked from, if any.
    pub parent_branch: Option<String>,
    /// Commit the branch pointed at when it was created.
    pub created_from: Digest,
    pub status: BranchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(
        name: impl Into<String>,
        head: Digest,
        parent_branch: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            head,
            parent_branch,
            created_from: head,
            status: BranchStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != BranchStatus::Deleted
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// `object` refers to `depends_on`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub object: Digest,
    pub depends_on: Digest,
}

// ---------------------------------------------------------------------------
// Merge strategies and operations
// ---------------------------------------------------------------------------

/// How the merge engine treats conflicts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Any blocking conflict halts the merge with no mutation.
    #[default]
    AbortOnConflict,
    /// Take the source side for every conflict.
    SourceWins,
    /// Take the target side for every conflict.
    TargetWins,
    /// Combine additive changes; leave the rest for manual resolution.
    Union,
    /// Classify and stop.
    ManualReview,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbortOnConflict => "abort_on_conflict",
            Self::SourceWins => "source_wins",
            Self::TargetWins => "target_wins",
            Self::Union => "union",
            Self::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort_on_conflict" | "abort" => Ok(Self::AbortOnConflict),
            "source_wins" => Ok(Self::SourceWins),
            "target_wins" => Ok(Self::TargetWins),
            "union" => Ok(Self::Union),
            "manual_review" => Ok(Self::ManualReview),
            other => Err(format!("unknown merge strategy '{other}'")),
        }
    }
}

/// States of a merge operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    BaseResolved,
    Classified,
    Clean,
    Conflicted,
    Resolved,
    ManualPending,
    Aborted,
    Committed,
    /// The source was already contained in the target; nothing was written.
    UpToDate,
}

impl MergeStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: MergeStatus) -> bool {
        use MergeStatus::*;
        matches!(
            (self, next),
            (Pending, BaseResolved)
                | (Pending, Aborted)
                | (BaseResolved, Classified)
                | (BaseResolved, UpToDate)
                | (BaseResolved, Committed)
                | (BaseResolved, Aborted)
                | (Classified, Clean)
                | (Classified, Conflicted)
                | (Clean, Committed)
                | (Conflicted, Resolved)
                | (Conflicted, ManualPending)
                | (Conflicted, Aborted)
                | (Resolved, Committed)
                | (ManualPending, Resolved)
        )
    }

    /// Whether the record is final and may be written to the audit log.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Aborted | Self::ManualPending | Self::UpToDate
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::BaseResolved => "base_resolved",
            Self::Classified => "classified",
            Self::Clean => "clean",
            Self::Conflicted => "conflicted",
            Self::Resolved => "resolved",
            Self::ManualPending => "manual_pending",
            Self::Aborted => "aborted",
            Self::Committed => "committed",
            Self::UpToDate => "up_to_date",
        }
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one merge attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeOperation {
    pub id: String,
    pub source: String,
    pub target: String,
    pub source_head: Option<Digest>,
    pub target_head: Option<Digest>,
    pub base: Option<Digest>,
    pub strategy: MergeStrategy,
    pub status: MergeStatus,
    pub conflicts: Vec<Conflict>,
    pub result_commit: Option<Digest>,
    pub message: String,
    /// Id of the `manual_pending` operation this one completed.
    pub resumed_from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MergeOperation {
    /// Start a new operation in the `pending` state.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        strategy: MergeStrategy,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            source_head: None,
            target_head: None,
            base: None,
            strategy,
            status: MergeStatus::Pending,
            conflicts: Vec::new(),
            result_commit: None,
            message: message.into(),
            resumed_from: None,
            created_at: now,
            finished_at: None,
        }
    }

    /// Number of conflicts still waiting for a resolution.
    pub fn pending_count(&self) -> usize {
        self.conflicts.iter().filter(|c| c.resolution.is_none()).count()
    }

    /// Conflicts still waiting for a resolution.
    pub fn pending_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.resolution.is_none())
    }

    /// Look up the resolution recorded for `path`.
    pub fn resolution_for(&self, path: &str) -> Option<&Resolution> {
        self.conflicts
            .iter()
            .find(|c| c.path == path)
            .and_then(|c| c.resolution.as_ref())
    }
}
