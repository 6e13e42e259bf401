//! Merge-base resolution over the commit DAG.
//!
//! Ancestor sets are collected breadth-first along every parent edge, so
//! merge commits are followed on all sides. The lowest common ancestors of
//! two commits are the members of the intersection that are not a strict
//! ancestor of another member. When a criss-cross history produces several,
//! [`AncestryResolver::find_merge_base`] picks the lexicographically smallest
//! digest so the choice is stable across runs and backends.
//!
//! Every traversal is bounded by `max_traversal` visited commits. Exceeding
//! the bound is reported as [`AncestryError::CyclicAncestry`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::digest::Digest;
use crate::errors::{AncestryError, StoreError};
use crate::models::{Branch, Commit};
use crate::store::ObjectStore;

/// Read-only queries over commit and branch ancestry.
#[derive(Clone)]
pub struct AncestryResolver {
    store: ObjectStore,
    max_traversal: usize,
}

impl AncestryResolver {
    pub fn new(store: ObjectStore, max_traversal: usize) -> Self {
        Self {
            store,
            max_traversal,
        }
    }

    /// The single merge base of `a` and `b`.
    ///
    /// `find_merge_base(c, c) == c`.
    pub fn find_merge_base(&self, a: &Digest, b: &Digest) -> Result<Digest, AncestryError> {
        let bases = self.merge_bases(a, b)?;
        // merge_bases never returns an empty list.
        let base = bases[0];
        if bases.len() > 1 {
            debug!(
                a = %a.short(),
                b = %b.short(),
                candidates = bases.len(),
                chosen = %base.short(),
                "multiple merge bases, picking smallest digest"
            );
        }
        Ok(base)
    }

    /// Every lowest common ancestor of `a` and `b`, sorted by digest.
    pub fn merge_bases(&self, a: &Digest, b: &Digest) -> Result<Vec<Digest>, AncestryError> {
        if a == b {
            self.require_commit(a)?;
            return Ok(vec![*a]);
        }

        let ancestors_a = self.ancestors(a)?;
        let ancestors_b = self.ancestors(b)?;
        let common: HashSet<Digest> = ancestors_a
            .keys()
            .filter(|d| ancestors_b.contains_key(*d))
            .copied()
            .collect();

        if common.is_empty() {
            return Err(AncestryError::NoCommonAncestor { a: *a, b: *b });
        }

        // Walk from the parents of every common member. Anything reached is a
        // strict ancestor of some common member and therefore not lowest.
        let mut dominated = HashSet::new();
        let mut queue = VecDeque::new();
        for digest in &common {
            queue.extend(self.store.get_commit(digest)?.parents);
        }
        while let Some(current) = queue.pop_front() {
            if !dominated.insert(current) {
                continue;
            }
            if dominated.len() > self.max_traversal {
                return Err(AncestryError::CyclicAncestry {
                    digest: current,
                    limit: self.max_traversal,
                });
            }
            queue.extend(self.store.get_commit(&current)?.parents);
        }

        let mut bases: Vec<Digest> = common
            .into_iter()
            .filter(|d| !dominated.contains(d))
            .collect();
        bases.sort();
        debug!(
            a = %a.short(),
            b = %b.short(),
            bases = bases.len(),
            "resolved merge bases"
        );
        Ok(bases)
    }

    /// Whether `ancestor` is reachable from `descendant` (inclusive).
    pub fn is_ancestor(&self, ancestor: &Digest, descendant: &Digest) -> Result<bool, AncestryError> {
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(self.ancestors(descendant)?.contains_key(ancestor))
    }

    /// Every commit reachable from `start` (inclusive), mapped to its BFS
    /// depth.
    pub fn ancestors(&self, start: &Digest) -> Result<HashMap<Digest, usize>, AncestryError> {
        let mut depths = HashMap::new();
        let mut queue = VecDeque::from([(*start, 0usize)]);

        while let Some((current, depth)) = queue.pop_front() {
            if depths.contains_key(&current) {
                continue;
            }
            depths.insert(current, depth);
            if depths.len() > self.max_traversal {
                warn!(
                    start = %start.short(),
                    limit = self.max_traversal,
                    "ancestry traversal exceeded bound"
                );
                return Err(AncestryError::CyclicAncestry {
                    digest: current,
                    limit: self.max_traversal,
                });
            }
            let commit = self.store.get_commit(&current)?;
            for parent in commit.parents {
                if parent == current {
                    return Err(AncestryError::CyclicAncestry {
                        digest: current,
                        limit: self.max_traversal,
                    });
                }
                queue.push_back((parent, depth + 1));
            }
        }
        Ok(depths)
    }

    /// History reachable from `head`, newest first, at most `limit` entries.
    ///
    /// Ties on timestamp are broken by digest.
    pub fn log(&self, head: &Digest, limit: usize) -> Result<Vec<Commit>, AncestryError> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut heap: BinaryHeap<(DateTime<Utc>, Reverse<Digest>)> = BinaryHeap::new();

        let first = self.store.get_commit(head)?;
        seen.insert(first.digest);
        heap.push((first.timestamp, Reverse(first.digest)));

        while let Some((_, Reverse(digest))) = heap.pop() {
            if out.len() >= limit {
                break;
            }
            if seen.len() > self.max_traversal {
                return Err(AncestryError::CyclicAncestry {
                    digest,
                    limit: self.max_traversal,
                });
            }
            let commit = self.store.get_commit(&digest)?;
            for parent in &commit.parents {
                if seen.insert(*parent) {
                    let parent_commit = self.store.get_commit(parent)?;
                    heap.push((parent_commit.timestamp, Reverse(*parent)));
                }
            }
            out.push(commit);
        }
        Ok(out)
    }

    /// Merge base of two branches.
    ///
    /// Commit ancestry is tried first. When the heads share no ancestor and
    /// one branch was forked (directly or transitively) from the other, the
    /// commit the fork started from is used instead.
    pub fn branch_merge_base(
        &self,
        source: &Branch,
        target: &Branch,
        lookup: impl Fn(&str) -> Result<Option<Branch>, StoreError>,
    ) -> Result<Digest, AncestryError> {
        match self.find_merge_base(&source.head, &target.head) {
            Err(AncestryError::NoCommonAncestor { a, b }) => {
                let fallback = match self.fork_point(source, &target.name, &lookup)? {
                    Some(point) => Some(point),
                    None => self.fork_point(target, &source.name, &lookup)?,
                };
                match fallback {
                    Some(point) => {
                        debug!(
                            source = %source.name,
                            target = %target.name,
                            base = %point.short(),
                            "using branch fork point as merge base"
                        );
                        Ok(point)
                    }
                    None => Err(AncestryError::NoCommonAncestor { a, b }),
                }
            }
            other => other,
        }
    }

    /// Follow `parent_branch` links up from `branch` looking for `ancestor`.
    /// Returns the `created_from` of the branch forked directly off it.
    fn fork_point(
        &self,
        branch: &Branch,
        ancestor: &str,
        lookup: &impl Fn(&str) -> Result<Option<Branch>, StoreError>,
    ) -> Result<Option<Digest>, AncestryError> {
        let mut visited = HashSet::new();
        let mut current = branch.clone();

        while let Some(parent_name) = current.parent_branch.clone() {
            if parent_name == ancestor {
                return Ok(Some(current.created_from));
            }
            if !visited.insert(parent_name.clone()) || visited.len() > self.max_traversal {
                return Ok(None);
            }
            match lookup(&parent_name)? {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    fn require_commit(&self, digest: &Digest) -> Result<(), AncestryError> {
        self.store.get_commit(digest)?;
        Ok(())
    }
}
