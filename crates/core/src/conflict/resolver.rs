//! Conflict resolution.
//!
//! [`ConflictResolver::apply_strategy`] fills in the `resolution` of each
//! conflict according to a [`MergeStrategy`], and
//! [`ConflictResolver::build_tree`] turns a fully resolved conflict list
//! into the merged root tree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::digest::Digest;
use crate::errors::{MergeError, StoreError};
use crate::models::{EntryKind, MergeStrategy, Tree, TreeEntry};
use crate::store::{join_path, ObjectStore};

use super::classifier::{entry_names, entry_version, should_descend, Conflict, ConflictKind};
use super::merger::Merger;

/// What to put at a conflicting path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", content = "digest", rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the source side, including its absence.
    AcceptSource,
    /// Keep the target side, including its absence.
    AcceptTarget,
    /// Store this object at the path.
    UseDigest(Digest),
    /// Remove the path.
    Delete,
}

impl Resolution {
    /// Digest left at the conflict's path once this resolution applies.
    pub fn outcome(&self, conflict: &Conflict) -> Option<Digest> {
        match self {
            Self::AcceptSource => conflict.source,
            Self::AcceptTarget => conflict.target,
            Self::UseDigest(digest) => Some(*digest),
            Self::Delete => None,
        }
    }
}

/// The resolution an auto-resolvable conflict gets without a strategy
/// override: keep whichever side changed.
pub fn auto_resolution(conflict: &Conflict) -> Option<Resolution> {
    if !conflict.auto_resolvable {
        return None;
    }
    match conflict.kind {
        ConflictKind::SourceModified | ConflictKind::DeletedSource => Some(Resolution::AcceptSource),
        ConflictKind::TargetModified | ConflictKind::DeletedTarget => Some(Resolution::AcceptTarget),
        ConflictKind::BothModified | ConflictKind::NoConflict => None,
    }
}

/// Reject a resolution that would delete an object live objects depend on.
pub fn check_resolution(conflict: &Conflict, resolution: &Resolution) -> Result<(), MergeError> {
    if let Some(base) = conflict.base {
        if conflict.has_dependents() && resolution.outcome(conflict).is_none() {
            return Err(MergeError::DependencyViolation {
                path: conflict.path.clone(),
                digest: base,
                dependents: conflict.dependents.clone(),
            });
        }
    }
    Ok(())
}

/// Result of running a strategy over a conflict list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// Every conflict has a resolution.
    Resolved,
    /// `abort_on_conflict` found a blocking conflict. Nothing was resolved.
    Aborted,
    /// Some conflicts are waiting for a caller.
    ManualPending,
}

/// Mode for a descended directory: the side that changed it from base wins,
/// target otherwise.
fn merged_mode(
    base: Option<&TreeEntry>,
    source: Option<&TreeEntry>,
    target: Option<&TreeEntry>,
) -> Option<u32> {
    let base_mode = base.map(|e| e.mode);
    match (source.map(|e| e.mode), target.map(|e| e.mode)) {
        (Some(s), Some(t)) if base_mode == Some(t) && s != t => Some(s),
        (s, t) => t.or(s),
    }
}

/// Applies strategies and builds merged trees.
#[derive(Clone)]
pub struct ConflictResolver {
    store: ObjectStore,
}

impl ConflictResolver {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Fill in resolutions for `conflicts` according to `strategy`.
    pub fn apply_strategy(
        &self,
        strategy: MergeStrategy,
        conflicts: &mut [Conflict],
    ) -> Result<StrategyOutcome, MergeError> {
        let outcome = match strategy {
            MergeStrategy::AbortOnConflict => {
                if conflicts.iter().any(Conflict::is_blocking) {
                    StrategyOutcome::Aborted
                } else {
                    for conflict in conflicts.iter_mut() {
                        conflict.resolution = auto_resolution(conflict);
                    }
                    StrategyOutcome::Resolved
                }
            }
            MergeStrategy::SourceWins | MergeStrategy::TargetWins => {
                let pick = if strategy == MergeStrategy::SourceWins {
                    Resolution::AcceptSource
                } else {
                    Resolution::AcceptTarget
                };
                for conflict in conflicts.iter() {
                    check_resolution(conflict, &pick)?;
                }
                for conflict in conflicts.iter_mut() {
                    conflict.resolution = Some(pick.clone());
                }
                StrategyOutcome::Resolved
            }
            MergeStrategy::Union => {
                for conflict in conflicts.iter_mut() {
                    conflict.resolution = match auto_resolution(conflict) {
                        Some(resolution) => Some(resolution),
                        None => self.union_resolution(conflict)?,
                    };
                }
                if conflicts.iter().any(|c| c.resolution.is_none()) {
                    StrategyOutcome::ManualPending
                } else {
                    StrategyOutcome::Resolved
                }
            }
            MergeStrategy::ManualReview => {
                for conflict in conflicts.iter_mut() {
                    conflict.resolution = auto_resolution(conflict);
                }
                if conflicts.is_empty() {
                    StrategyOutcome::Resolved
                } else {
                    StrategyOutcome::ManualPending
                }
            }
        };

        info!(
            strategy = %strategy,
            conflicts = conflicts.len(),
            pending = conflicts.iter().filter(|c| c.resolution.is_none()).count(),
            outcome = ?outcome,
            "applied merge strategy"
        );
        Ok(outcome)
    }

    /// Try to combine two edits of a blob that only add lines.
    fn union_resolution(&self, conflict: &Conflict) -> Result<Option<Resolution>, StoreError> {
        let (Some(source), Some(target)) = (conflict.source, conflict.target) else {
            return Ok(None);
        };
        if conflict.kind != ConflictKind::BothModified || conflict.object_kind != EntryKind::Blob {
            return Ok(None);
        }
        // Same content with diverging modes has nothing to combine.
        if source == target {
            return Ok(None);
        }

        let base = match conflict.base {
            Some(digest) => self.store.get_blob(&digest)?,
            None => Vec::new(),
        };
        let source_bytes = self.store.get_blob(&source)?;
        let target_bytes = self.store.get_blob(&target)?;

        let (Ok(base), Ok(source_text), Ok(target_text)) = (
            String::from_utf8(base),
            String::from_utf8(source_bytes),
            String::from_utf8(target_bytes),
        ) else {
            debug!(path = %conflict.path, "union skipped for binary content");
            return Ok(None);
        };

        match Merger::additive_union(&base, &source_text, &target_text) {
            Some(merged) => {
                let digest = self.store.put_blob(merged.as_bytes())?;
                debug!(path = %conflict.path, merged = %digest.short(), "union combined blob");
                Ok(Some(Resolution::UseDigest(digest)))
            }
            None => Ok(None),
        }
    }

    /// Build the merged root tree from the three root trees and the resolved
    /// conflicts. Paths where source and target agree are taken as-is.
    ///
    /// Directories left empty by the merge are dropped.
    pub fn build_tree(
        &self,
        base: Option<&Digest>,
        source: &Digest,
        target: &Digest,
        conflicts: &[Conflict],
    ) -> Result<Digest, MergeError> {
        let decisions: HashMap<&str, &Resolution> = conflicts
            .iter()
            .filter_map(|c| c.resolution.as_ref().map(|r| (c.path.as_str(), r)))
            .collect();

        let base_tree = base.map(|d| self.store.get_tree(d)).transpose()?;
        let source_tree = self.store.get_tree(source)?;
        let target_tree = self.store.get_tree(target)?;

        let entries = self.build_level(
            "",
            base_tree.as_ref(),
            Some(&source_tree),
            Some(&target_tree),
            &decisions,
        )?;
        let root = self.store.put_tree(entries)?;
        debug!(root = %root.short(), "built merged tree");
        Ok(root)
    }

    fn build_level(
        &self,
        prefix: &str,
        base: Option<&Tree>,
        source: Option<&Tree>,
        target: Option<&Tree>,
        decisions: &HashMap<&str, &Resolution>,
    ) -> Result<Vec<TreeEntry>, MergeError> {
        let mut entries = Vec::new();

        for name in entry_names([base, source, target]) {
            let path = join_path(prefix, name);
            let eb = base.and_then(|t| t.get(name));
            let es = source.and_then(|t| t.get(name));
            let et = target.and_then(|t| t.get(name));

            if should_descend(eb, es, et) {
                let sub_base = self.subtree(eb)?;
                let sub_source = self.subtree(es)?;
                let sub_target = self.subtree(et)?;
                let children = self.build_level(
                    &path,
                    sub_base.as_ref(),
                    sub_source.as_ref(),
                    sub_target.as_ref(),
                    decisions,
                )?;
                if !children.is_empty() {
                    let mode = merged_mode(eb, es, et).unwrap_or(TreeEntry::MODE_TREE);
                    entries.push(TreeEntry {
                        name: name.to_string(),
                        kind: EntryKind::Tree,
                        mode,
                        target: self.store.put_tree(children)?,
                    });
                }
                continue;
            }

            let chosen = match decisions.get(path.as_str()) {
                Some(Resolution::AcceptSource) => es.cloned(),
                Some(Resolution::AcceptTarget) => et.cloned(),
                Some(Resolution::Delete) => None,
                Some(Resolution::UseDigest(digest)) => {
                    Some(self.entry_for(name, digest, et.or(es))?)
                }
                None if es.map(entry_version) == et.map(entry_version) => et.cloned(),
                None => return Err(MergeError::MissingResolution(path)),
            };
            entries.extend(chosen);
        }
        Ok(entries)
    }

    fn subtree(&self, entry: Option<&TreeEntry>) -> Result<Option<Tree>, StoreError> {
        match entry {
            Some(e) if e.is_tree() => Ok(Some(self.store.get_tree(&e.target)?)),
            _ => Ok(None),
        }
    }

    /// Entry for a caller-chosen digest. The kind comes from the store; the
    /// mode is kept from an existing side of the same kind.
    fn entry_for(
        &self,
        name: &str,
        digest: &Digest,
        existing: Option<&TreeEntry>,
    ) -> Result<TreeEntry, StoreError> {
        let kind = if self.store.has_tree(digest)? {
            EntryKind::Tree
        } else if self.store.has_blob(digest)? {
            EntryKind::Blob
        } else {
            return Err(StoreError::ObjectNotFound {
                kind: crate::models::ObjectKind::Blob,
                digest: *digest,
            });
        };
        let mode = match existing {
            Some(e) if e.kind == kind => e.mode,
            _ => kind.default_mode(),
        };
        Ok(TreeEntry {
            name: name.to_string(),
            kind,
            mode,
            target: *digest,
        })
    }
}
