//! Three-way conflict classification.
//!
//! The classifier walks the union of paths in the base, source and target
//! trees and compares the entry each side holds at every path: kind, mode
//! and digest together, so a mode-only change is a change. Directories
//! are descended into when every side that has the path holds a tree, so a
//! conflict is always reported at the deepest path where the sides disagree.
//! A path where one side holds a blob and another a tree is reported as a
//! single container conflict.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::deps::DependencyTracker;
use crate::digest::Digest;
use crate::errors::StoreError;
use crate::models::{EntryKind, Tree, TreeEntry};
use crate::store::{join_path, ObjectStore};

use super::Resolution;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Outcome of comparing the base, source and target digests at one path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    NoConflict,
    SourceModified,
    TargetModified,
    BothModified,
    DeletedSource,
    DeletedTarget,
}

impl ConflictKind {
    /// Apply the classification table to one path. `None` means absent.
    pub fn from_digests(
        base: Option<&Digest>,
        source: Option<&Digest>,
        target: Option<&Digest>,
    ) -> Self {
        Self::from_versions(base, source, target)
    }

    /// The same table over any comparable notion of "version".
    pub fn from_versions<T: PartialEq + ?Sized>(
        base: Option<&T>,
        source: Option<&T>,
        target: Option<&T>,
    ) -> Self {
        match (base, source, target) {
            (None, None, None) => Self::NoConflict,
            (Some(b), Some(s), Some(t)) => {
                if s == t {
                    Self::NoConflict
                } else if b == s {
                    Self::TargetModified
                } else if b == t {
                    Self::SourceModified
                } else {
                    Self::BothModified
                }
            }
            (None, Some(s), Some(t)) if s == t => Self::NoConflict,
            (None, Some(_), Some(_)) => Self::BothModified,
            (Some(b), None, Some(t)) if b == t => Self::DeletedSource,
            (Some(b), Some(s), None) if b == s => Self::DeletedTarget,
            // Modified on one side, deleted on the other.
            (Some(_), None, Some(_)) | (Some(_), Some(_), None) => Self::BothModified,
            (Some(_), None, None) => Self::NoConflict,
            (None, Some(_), None) => Self::SourceModified,
            (None, None, Some(_)) => Self::TargetModified,
        }
    }

    /// Default auto-resolvability before dependency checks.
    pub fn is_auto_resolvable(&self) -> bool {
        !matches!(self, Self::BothModified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoConflict => "no_conflict",
            Self::SourceModified => "source_modified",
            Self::TargetModified => "target_modified",
            Self::BothModified => "both_modified",
            Self::DeletedSource => "deleted_source",
            Self::DeletedTarget => "deleted_target",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much attention a conflict needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
        }
    }
}

/// A classified difference at one path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    /// Slash-separated path from the root tree.
    pub path: String,
    pub kind: ConflictKind,
    /// `tree` when any side holds a tree at this path.
    pub object_kind: EntryKind,
    pub base: Option<Digest>,
    pub source: Option<Digest>,
    pub target: Option<Digest>,
    /// Entry modes on each side, for conflicts that differ only in mode.
    #[serde(default)]
    pub base_mode: Option<u32>,
    #[serde(default)]
    pub source_mode: Option<u32>,
    #[serde(default)]
    pub target_mode: Option<u32>,
    pub severity: Severity,
    pub auto_resolvable: bool,
    /// Live objects that depend on what this conflict would delete.
    pub dependents: Vec<Digest>,
    /// Chosen resolution. `None` while pending.
    pub resolution: Option<Resolution>,
}

impl Conflict {
    /// Whether this conflict stops an `abort_on_conflict` merge.
    pub fn is_blocking(&self) -> bool {
        !self.auto_resolvable || self.severity == Severity::Major
    }

    /// Whether applying this conflict's deletion would break dependents.
    pub fn has_dependents(&self) -> bool {
        !self.dependents.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// What identifies an entry's content at one path.
pub(crate) type EntryVersion = (EntryKind, u32, Digest);

pub(crate) fn entry_version(entry: &TreeEntry) -> EntryVersion {
    (entry.kind, entry.mode, entry.target)
}

/// Classify one path from the three entries.
pub(crate) fn classify_entries(
    base: Option<&TreeEntry>,
    source: Option<&TreeEntry>,
    target: Option<&TreeEntry>,
) -> ConflictKind {
    let (vb, vs, vt) = (
        base.map(entry_version),
        source.map(entry_version),
        target.map(entry_version),
    );
    ConflictKind::from_versions(vb.as_ref(), vs.as_ref(), vt.as_ref())
}

/// Whether the walk should descend into `path` instead of reporting it.
///
/// True when the sides hold different trees and every side holding the path
/// holds a tree. Trees with equal digests but different modes are reported
/// as a leaf.
pub(crate) fn should_descend(
    base: Option<&TreeEntry>,
    source: Option<&TreeEntry>,
    target: Option<&TreeEntry>,
) -> bool {
    let differs = source.map(|e| e.target) != target.map(|e| e.target);
    let all_trees = [base, source, target]
        .into_iter()
        .flatten()
        .all(TreeEntry::is_tree);
    differs && all_trees && (source.is_some() || target.is_some())
}

/// Union of entry names across up to three trees, sorted.
pub(crate) fn entry_names<'t>(trees: [Option<&'t Tree>; 3]) -> BTreeSet<&'t str> {
    trees
        .into_iter()
        .flatten()
        .flat_map(|t| t.entries.iter().map(|e| e.name.as_str()))
        .collect()
}

/// Computes the conflict list for a three-way merge.
#[derive(Clone)]
pub struct ConflictClassifier {
    store: ObjectStore,
    deps: DependencyTracker,
    structural_patterns: Vec<String>,
}

struct Walk<'w> {
    live: &'w HashSet<Digest>,
    out: Vec<Conflict>,
}

impl ConflictClassifier {
    pub fn new(store: ObjectStore, deps: DependencyTracker, structural_patterns: Vec<String>) -> Self {
        Self {
            store,
            deps,
            structural_patterns,
        }
    }

    /// Classify every path where `source` and `target` differ relative to
    /// `base`. Without a base every difference is treated as an addition.
    ///
    /// Conflicts are returned ordered by path.
    pub fn classify(
        &self,
        source: &Digest,
        target: &Digest,
        base: Option<&Digest>,
    ) -> Result<Vec<Conflict>, StoreError> {
        let source_tree = self.store.get_tree(source)?;
        let target_tree = self.store.get_tree(target)?;
        let base_tree = base.map(|d| self.store.get_tree(d)).transpose()?;

        let live = self.live_objects(source, target, base)?;
        let mut walk = Walk {
            live: &live,
            out: Vec::new(),
        };
        self.walk(
            "",
            base_tree.as_ref(),
            Some(&source_tree),
            Some(&target_tree),
            &mut walk,
        )?;

        let conflicts = walk.out;
        info!(
            source = %source.short(),
            target = %target.short(),
            base = base.map(|b| b.short()).unwrap_or_else(|| "-".into()),
            conflicts = conflicts.len(),
            blocking = conflicts.iter().filter(|c| c.is_blocking()).count(),
            "classified trees"
        );
        Ok(conflicts)
    }

    /// Objects expected to survive the merge: everything either side holds,
    /// minus base objects that at least one side dropped.
    fn live_objects(
        &self,
        source: &Digest,
        target: &Digest,
        base: Option<&Digest>,
    ) -> Result<HashSet<Digest>, StoreError> {
        let in_source = self.store.reachable(source)?;
        let in_target = self.store.reachable(target)?;
        let mut live: HashSet<Digest> = in_source.union(&in_target).copied().collect();
        if let Some(base) = base {
            for digest in self.store.reachable(base)? {
                if !(in_source.contains(&digest) && in_target.contains(&digest)) {
                    live.remove(&digest);
                }
            }
        }
        Ok(live)
    }

    fn walk(
        &self,
        prefix: &str,
        base: Option<&Tree>,
        source: Option<&Tree>,
        target: Option<&Tree>,
        walk: &mut Walk<'_>,
    ) -> Result<(), StoreError> {
        for name in entry_names([base, source, target]) {
            let path = join_path(prefix, name);
            let eb = base.and_then(|t| t.get(name));
            let es = source.and_then(|t| t.get(name));
            let et = target.and_then(|t| t.get(name));

            if should_descend(eb, es, et) {
                let sub_base = self.subtree(eb)?;
                let sub_source = self.subtree(es)?;
                let sub_target = self.subtree(et)?;
                self.walk(
                    &path,
                    sub_base.as_ref(),
                    sub_source.as_ref(),
                    sub_target.as_ref(),
                    walk,
                )?;
                continue;
            }

            let kind = classify_entries(eb, es, et);
            if kind == ConflictKind::NoConflict {
                continue;
            }
            let conflict = self.build_conflict(path, kind, eb, es, et, walk.live)?;
            debug!(
                path = %conflict.path,
                kind = %conflict.kind,
                severity = %conflict.severity,
                auto_resolvable = conflict.auto_resolvable,
                "conflict"
            );
            walk.out.push(conflict);
        }
        Ok(())
    }

    fn subtree(&self, entry: Option<&TreeEntry>) -> Result<Option<Tree>, StoreError> {
        match entry {
            Some(e) if e.is_tree() => Ok(Some(self.store.get_tree(&e.target)?)),
            _ => Ok(None),
        }
    }

    fn build_conflict(
        &self,
        path: String,
        kind: ConflictKind,
        base: Option<&TreeEntry>,
        source: Option<&TreeEntry>,
        target: Option<&TreeEntry>,
        live: &HashSet<Digest>,
    ) -> Result<Conflict, StoreError> {
        let object_kind = if [base, source, target].into_iter().flatten().any(TreeEntry::is_tree) {
            EntryKind::Tree
        } else {
            EntryKind::Blob
        };

        let mut dependents = Vec::new();
        if let Some(b) = base {
            if source.is_none() || target.is_none() {
                let removed = if b.is_tree() {
                    self.store.reachable(&b.target)?
                } else {
                    HashSet::from([b.target])
                };
                dependents = self.deps.live_dependents(&removed, live)?;
            }
        }

        let diverging_addition = base.is_none() && source.is_some() && target.is_some();
        let major = object_kind == EntryKind::Tree
            || diverging_addition
            || !dependents.is_empty()
            || self.is_structural(&path);

        Ok(Conflict {
            kind,
            object_kind,
            base: base.map(|e| e.target),
            source: source.map(|e| e.target),
            target: target.map(|e| e.target),
            base_mode: base.map(|e| e.mode),
            source_mode: source.map(|e| e.mode),
            target_mode: target.map(|e| e.mode),
            severity: if major { Severity::Major } else { Severity::Minor },
            auto_resolvable: kind.is_auto_resolvable() && dependents.is_empty(),
            dependents,
            resolution: None,
            path,
        })
    }

    fn is_structural(&self, path: &str) -> bool {
        self.structural_patterns
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, path))
    }
}
