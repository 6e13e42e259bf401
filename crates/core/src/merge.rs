//! Merge engine.
//!
//! A merge moves one [`MergeOperation`] through its state machine:
//!
//! ```text
//! pending -> base_resolved -> classified -> clean -> committed
//!                 |                      \-> conflicted -> resolved -> committed
//!                 |                                     \-> manual_pending
//!                 |                                     \-> aborted
//!                 \-> up_to_date | committed (fast-forward)
//! ```
//!
//! The target branch lock is held from the moment the heads are read until
//! the branch pointer has moved, so the result commit and the branch update
//! either both happen or the branch is left untouched. A commit written
//! before a failed pointer update is unreachable and harmless.
//!
//! Every operation that reaches a final state is appended to the merge log.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ancestry::AncestryResolver;
use crate::backend::Backend;
use crate::clock::Clock;
use crate::conflict::{check_resolution, ConflictClassifier, ConflictResolver, Resolution, StrategyOutcome};
use crate::digest::Digest;
use crate::errors::{BranchError, MergeError, StoreError};
use crate::models::{MergeOperation, MergeStatus, MergeStrategy, Signature};
use crate::refs::{BranchGuard, BranchManager};
use crate::store::ObjectStore;

/// Advance `op` to `next`, rejecting transitions the state machine forbids.
fn transition(op: &mut MergeOperation, next: MergeStatus) -> Result<(), MergeError> {
    if !op.status.can_transition_to(next) {
        return Err(MergeError::InvalidStateTransition {
            from: op.status.to_string(),
            to: next.to_string(),
        });
    }
    debug!(id = %op.id, from = %op.status, to = %next, "merge state");
    op.status = next;
    Ok(())
}

/// Heads and trees a merge commits against.
struct MergeInputs {
    source_head: Digest,
    target_head: Digest,
    base_tree: Digest,
    source_tree: Digest,
    target_tree: Digest,
}

/// Runs merges between branches.
pub struct MergeEngine {
    store: ObjectStore,
    backend: Arc<dyn Backend>,
    branches: Arc<BranchManager>,
    ancestry: AncestryResolver,
    classifier: ConflictClassifier,
    resolver: ConflictResolver,
    clock: Arc<dyn Clock>,
    author: Signature,
    allow_fast_forward: bool,
}

impl MergeEngine {
    pub fn new(
        store: ObjectStore,
        branches: Arc<BranchManager>,
        ancestry: AncestryResolver,
        classifier: ConflictClassifier,
        clock: Arc<dyn Clock>,
        author: Signature,
        allow_fast_forward: bool,
    ) -> Self {
        Self {
            backend: store.backend().clone(),
            resolver: ConflictResolver::new(store.clone()),
            store,
            branches,
            ancestry,
            classifier,
            clock,
            author,
            allow_fast_forward,
        }
    }

    /// Merge `source` into `target`.
    ///
    /// Returns the finished operation: `committed`, `up_to_date`, or
    /// `manual_pending` under `manual_review`. Blocking conflicts under
    /// `abort_on_conflict` return [`MergeError::MergeAborted`]; conflicts a
    /// strategy could not settle return [`MergeError::UnresolvedConflicts`].
    /// Both carry the recorded operation.
    pub fn merge(
        &self,
        source: &str,
        target: &str,
        strategy: MergeStrategy,
        message: &str,
    ) -> Result<MergeOperation, MergeError> {
        if source == target {
            return Err(MergeError::SelfMerge(source.to_string()));
        }

        let message = if message.trim().is_empty() {
            format!("Merge branch '{source}' into '{target}'")
        } else {
            message.to_string()
        };
        let mut op = MergeOperation::new(source, target, strategy, message, self.clock.now());
        info!(id = %op.id, source, target, strategy = %strategy, "starting merge");

        let guard = self.branches.lock(target)?;
        let source_branch = self.branches.get_branch(source)?;
        let target_branch = self.branches.get_branch(target)?;
        op.source_head = Some(source_branch.head);
        op.target_head = Some(target_branch.head);

        let base = self
            .ancestry
            .branch_merge_base(&source_branch, &target_branch, |name| {
                self.backend.get_branch(name).map_err(StoreError::from)
            })?;
        op.base = Some(base);
        transition(&mut op, MergeStatus::BaseResolved)?;

        if base == source_branch.head {
            transition(&mut op, MergeStatus::UpToDate)?;
            info!(id = %op.id, source, target, "already up to date");
            return self.finish(op);
        }

        if self.allow_fast_forward && base == target_branch.head {
            self.branches
                .advance_locked(&guard, &target_branch.head, source_branch.head)?;
            op.result_commit = Some(source_branch.head);
            transition(&mut op, MergeStatus::Committed)?;
            info!(id = %op.id, source, target, head = %source_branch.head.short(), "fast-forwarded");
            self.mark_source_merged(source, &source_branch.head);
            return self.finish(op);
        }

        let inputs = MergeInputs {
            source_head: source_branch.head,
            target_head: target_branch.head,
            base_tree: self.store.get_commit(&base)?.tree,
            source_tree: self.store.get_commit(&source_branch.head)?.tree,
            target_tree: self.store.get_commit(&target_branch.head)?.tree,
        };

        let mut conflicts = self.classifier.classify(
            &inputs.source_tree,
            &inputs.target_tree,
            Some(&inputs.base_tree),
        )?;
        transition(&mut op, MergeStatus::Classified)?;

        if conflicts.is_empty() {
            transition(&mut op, MergeStatus::Clean)?;
        } else {
            transition(&mut op, MergeStatus::Conflicted)?;
            let outcome = match self.resolver.apply_strategy(strategy, &mut conflicts) {
                Ok(outcome) => outcome,
                Err(err @ MergeError::DependencyViolation { .. }) => {
                    op.conflicts = conflicts;
                    transition(&mut op, MergeStatus::Aborted)?;
                    warn!(id = %op.id, error = %err, "merge refused");
                    self.finish(op)?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            op.conflicts = conflicts;

            match outcome {
                StrategyOutcome::Aborted => {
                    transition(&mut op, MergeStatus::Aborted)?;
                    info!(id = %op.id, conflicts = op.conflicts.len(), "merge aborted");
                    let op = self.finish(op)?;
                    return Err(MergeError::MergeAborted(Box::new(op)));
                }
                StrategyOutcome::ManualPending => {
                    transition(&mut op, MergeStatus::ManualPending)?;
                    info!(id = %op.id, pending = op.pending_count(), "merge awaiting manual resolution");
                    let op = self.finish(op)?;
                    if strategy == MergeStrategy::ManualReview {
                        return Ok(op);
                    }
                    return Err(MergeError::UnresolvedConflicts(Box::new(op)));
                }
                StrategyOutcome::Resolved => transition(&mut op, MergeStatus::Resolved)?,
            }
        }

        self.commit(&mut op, &guard, &inputs)?;
        self.mark_source_merged(source, &inputs.source_head);
        self.finish(op)
    }

    /// Finish a `manual_pending` operation with caller-chosen resolutions.
    ///
    /// Resolutions replace whatever the strategy proposed for the named
    /// paths. The target branch must not have moved since the operation was
    /// recorded. The completed merge is logged as a new operation whose
    /// `resumed_from` names `op`.
    pub fn complete_manual(
        &self,
        op: &MergeOperation,
        resolutions: Vec<(String, Resolution)>,
    ) -> Result<MergeOperation, MergeError> {
        let (MergeStatus::ManualPending, Some(source_head), Some(target_head), Some(base)) =
            (op.status, op.source_head, op.target_head, op.base)
        else {
            return Err(MergeError::NotPending {
                id: op.id.clone(),
                status: op.status.to_string(),
            });
        };

        let mut next = op.clone();
        next.id = uuid::Uuid::new_v4().to_string();
        next.resumed_from = Some(op.id.clone());
        next.created_at = self.clock.now();
        next.finished_at = None;

        for (path, resolution) in resolutions {
            let conflict = next
                .conflicts
                .iter_mut()
                .find(|c| c.path == path)
                .ok_or_else(|| MergeError::UnknownConflictPath(path.clone()))?;
            check_resolution(conflict, &resolution)?;
            conflict.resolution = Some(resolution);
        }
        if next.pending_count() > 0 {
            return Err(MergeError::UnresolvedConflicts(Box::new(next)));
        }

        let guard = self.branches.lock(&op.target)?;
        let current = self.branches.get_branch(&op.target)?;
        if current.head != target_head {
            return Err(BranchError::StaleHead {
                branch: op.target.clone(),
                expected: target_head,
                actual: current.head,
            }
            .into());
        }

        let inputs = MergeInputs {
            source_head,
            target_head,
            base_tree: self.store.get_commit(&base)?.tree,
            source_tree: self.store.get_commit(&source_head)?.tree,
            target_tree: self.store.get_commit(&target_head)?.tree,
        };
        transition(&mut next, MergeStatus::Resolved)?;
        self.commit(&mut next, &guard, &inputs)?;
        info!(id = %next.id, resumed_from = %op.id, "manual merge completed");
        self.mark_source_merged(&op.source, &source_head);
        self.finish(next)
    }

    /// Build the merged tree, write the merge commit, and swing the target.
    fn commit(
        &self,
        op: &mut MergeOperation,
        guard: &BranchGuard<'_>,
        inputs: &MergeInputs,
    ) -> Result<(), MergeError> {
        let tree = self.resolver.build_tree(
            Some(&inputs.base_tree),
            &inputs.source_tree,
            &inputs.target_tree,
            &op.conflicts,
        )?;
        let commit = self.store.put_commit(
            tree,
            &[inputs.target_head, inputs.source_head],
            &self.author,
            &op.message,
            self.clock.now(),
        )?;
        self.branches
            .advance_locked(guard, &inputs.target_head, commit)?;
        op.result_commit = Some(commit);
        transition(op, MergeStatus::Committed)?;
        info!(
            id = %op.id,
            target = %op.target,
            commit = %commit.short(),
            tree = %tree.short(),
            "merge committed"
        );
        Ok(())
    }

    fn mark_source_merged(&self, source: &str, head: &Digest) {
        match self.branches.mark_merged(source, head) {
            Ok(true) => {}
            Ok(false) => {
                debug!(branch = source, head = %head.short(), "source branch moved on, not marked merged")
            }
            Err(e) => warn!(branch = source, error = %e, "could not mark source branch merged"),
        }
    }

    /// Stamp and log a finished operation.
    fn finish(&self, mut op: MergeOperation) -> Result<MergeOperation, MergeError> {
        if !op.status.is_final() {
            return Err(MergeError::InvalidStateTransition {
                from: op.status.to_string(),
                to: "logged".into(),
            });
        }
        op.finished_at = Some(self.clock.now());
        self.backend.append_merge_operation(&op)?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::SystemClock;
    use crate::conflict::ConflictKind;
    use crate::deps::DependencyTracker;
    use crate::models::TreeEntry;
    use crate::store::TreeBuilder;
    use std::time::Duration;

    struct Harness {
        store: ObjectStore,
        branches: Arc<BranchManager>,
        engine: MergeEngine,
        backend: Arc<MemoryBackend>,
    }

    fn harness(allow_fast_forward: bool) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let store = ObjectStore::new(backend.clone());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let branches = Arc::new(BranchManager::new(
            store.clone(),
            clock.clone(),
            "main",
            Duration::from_millis(200),
        ));
        let engine = MergeEngine::new(
            store.clone(),
            branches.clone(),
            AncestryResolver::new(store.clone(), 10_000),
            ConflictClassifier::new(
                store.clone(),
                DependencyTracker::new(backend.clone()),
                Vec::new(),
            ),
            clock,
            Signature::new("merger", "merger@test"),
            allow_fast_forward,
        );
        Harness {
            store,
            branches,
            engine,
            backend,
        }
    }

    impl Harness {
        fn commit_on(&self, branch: Option<&str>, files: &[(&str, &str)], parents: &[Digest]) -> Digest {
            let mut builder = TreeBuilder::new(&self.store);
            for (path, content) in files {
                builder.insert_blob(path, content.as_bytes()).unwrap();
            }
            let tree = builder.build().unwrap();
            let commit = self
                .store
                .put_commit(tree, parents, &Signature::new("t", "t@x"), "c", chrono::Utc::now())
                .unwrap();
            if let Some(name) = branch {
                self.branches.advance_branch(name, commit).unwrap();
            }
            commit
        }

        fn head(&self, branch: &str) -> Digest {
            self.branches.get_branch(branch).unwrap().head
        }

        fn file(&self, commit: &Digest, path: &str) -> Option<String> {
            let tree = self.store.get_commit(commit).unwrap().tree;
            self.store
                .read_path(&tree, path)
                .unwrap()
                .map(|e| String::from_utf8(self.store.get_blob(&e.target).unwrap()).unwrap())
        }

        /// main and feature forked from a root holding `files`.
        fn forked(&self, files: &[(&str, &str)]) -> Digest {
            let root = self.commit_on(None, files, &[]);
            self.branches.create_branch("main", root).unwrap();
            self.branches.fork_branch("feature", "main").unwrap();
            root
        }
    }

    #[test]
    fn test_self_merge_rejected() {
        let h = harness(false);
        h.forked(&[("f", "1")]);
        let err = h.engine.merge("main", "main", MergeStrategy::SourceWins, "").unwrap_err();
        assert!(matches!(err, MergeError::SelfMerge(_)));
        assert!(h.backend.list_merge_operations(10).unwrap().is_empty());
    }

    #[test]
    fn test_clean_merge_creates_merge_commit() {
        let h = harness(false);
        let root = h.forked(&[("a", "1"), ("b", "1")]);
        let f1 = h.commit_on(Some("feature"), &[("a", "2"), ("b", "1")], &[root]);
        let m1 = h.commit_on(Some("main"), &[("a", "1"), ("b", "2")], &[root]);

        let op = h
            .engine
            .merge("feature", "main", MergeStrategy::AbortOnConflict, "")
            .unwrap();
        assert_eq!(op.status, MergeStatus::Committed);
        assert_eq!(op.base, Some(root));
        assert_eq!(op.message, "Merge branch 'feature' into 'main'");

        let result = op.result_commit.unwrap();
        assert_eq!(h.head("main"), result);
        let commit = h.store.get_commit(&result).unwrap();
        assert_eq!(commit.parents, vec![m1, f1]);
        assert_eq!(h.file(&result, "a").as_deref(), Some("2"));
        assert_eq!(h.file(&result, "b").as_deref(), Some("2"));
        assert_eq!(
            h.branches.get_branch("feature").unwrap().status,
            crate::models::BranchStatus::Merged
        );
    }

    #[test]
    fn test_up_to_date_writes_nothing() {
        let h = harness(false);
        let root = h.forked(&[("a", "1")]);
        h.commit_on(Some("main"), &[("a", "2")], &[root]);
        let before = h.head("main");

        let op = h
            .engine
            .merge("feature", "main", MergeStrategy::AbortOnConflict, "")
            .unwrap();
        assert_eq!(op.status, MergeStatus::UpToDate);
        assert_eq!(op.result_commit, None);
        assert_eq!(h.head("main"), before);
    }

    #[test]
    fn test_fast_forward_when_enabled() {
        let h = harness(true);
        let root = h.forked(&[("a", "1")]);
        let f1 = h.commit_on(Some("feature"), &[("a", "2")], &[root]);

        let op = h
            .engine
            .merge("feature", "main", MergeStrategy::AbortOnConflict, "")
            .unwrap();
        assert_eq!(op.status, MergeStatus::Committed);
        assert_eq!(op.result_commit, Some(f1));
        assert_eq!(h.head("main"), f1);
    }

    #[test]
    fn test_abort_leaves_target_and_logs() {
        let h = harness(false);
        let root = h.forked(&[("file", "1")]);
        h.commit_on(Some("feature"), &[("file", "2")], &[root]);
        let m1 = h.commit_on(Some("main"), &[("file", "3")], &[root]);

        let err = h
            .engine
            .merge("feature", "main", MergeStrategy::AbortOnConflict, "")
            .unwrap_err();
        let op = match err {
            MergeError::MergeAborted(op) => op,
            other => panic!("expected MergeAborted, got {other:?}"),
        };
        assert_eq!(op.status, MergeStatus::Aborted);
        assert_eq!(op.conflicts[0].kind, ConflictKind::BothModified);
        assert_eq!(h.head("main"), m1);

        let log = h.backend.list_merge_operations(10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, op.id);
    }

    #[test]
    fn test_manual_review_then_complete() {
        let h = harness(false);
        let root = h.forked(&[("file", "1"), ("other", "o")]);
        h.commit_on(Some("feature"), &[("file", "2"), ("other", "o")], &[root]);
        h.commit_on(Some("main"), &[("file", "3"), ("other", "o2")], &[root]);
        let before = h.head("main");

        let op = h
            .engine
            .merge("feature", "main", MergeStrategy::ManualReview, "merge it")
            .unwrap();
        assert_eq!(op.status, MergeStatus::ManualPending);
        assert_eq!(op.pending_count(), 1);
        assert_eq!(h.head("main"), before);

        let err = h.engine.complete_manual(&op, Vec::new()).unwrap_err();
        assert!(matches!(err, MergeError::UnresolvedConflicts(_)));

        let err = h
            .engine
            .complete_manual(&op, vec![("nope".into(), Resolution::AcceptSource)])
            .unwrap_err();
        assert!(matches!(err, MergeError::UnknownConflictPath(_)));

        let done = h
            .engine
            .complete_manual(&op, vec![("file".into(), Resolution::AcceptSource)])
            .unwrap();
        assert_eq!(done.status, MergeStatus::Committed);
        assert_eq!(done.resumed_from.as_deref(), Some(op.id.as_str()));
        let head = h.head("main");
        assert_eq!(done.result_commit, Some(head));
        assert_eq!(h.file(&head, "file").as_deref(), Some("2"));
        assert_eq!(h.file(&head, "other").as_deref(), Some("o2"));

        // A second completion of the same record sees the moved head.
        let err = h
            .engine
            .complete_manual(&op, vec![("file".into(), Resolution::AcceptTarget)])
            .unwrap_err();
        assert!(matches!(err, MergeError::Branch(BranchError::StaleHead { .. })));

        let err = h.engine.complete_manual(&done, Vec::new()).unwrap_err();
        assert!(matches!(err, MergeError::NotPending { .. }));
    }

    #[test]
    fn test_union_pending_returns_unresolved() {
        let h = harness(false);
        let root = h.forked(&[("file", "x\n")]);
        h.commit_on(Some("feature"), &[("file", "y\n")], &[root]);
        let m1 = h.commit_on(Some("main"), &[("file", "z\n")], &[root]);

        let err = h
            .engine
            .merge("feature", "main", MergeStrategy::Union, "")
            .unwrap_err();
        let op = match err {
            MergeError::UnresolvedConflicts(op) => op,
            other => panic!("expected UnresolvedConflicts, got {other:?}"),
        };
        assert_eq!(op.status, MergeStatus::ManualPending);
        assert_eq!(h.head("main"), m1);
    }

    #[test]
    fn test_lock_held_elsewhere_times_out() {
        let h = harness(false);
        let root = h.forked(&[("a", "1")]);
        h.commit_on(Some("feature"), &[("a", "2")], &[root]);

        let _held = h.branches.lock("main").unwrap();
        let err = h
            .engine
            .merge("feature", "main", MergeStrategy::SourceWins, "")
            .unwrap_err();
        assert!(matches!(err, MergeError::Branch(BranchError::LockTimeout { .. })));
    }

    #[test]
    fn test_transition_guard() {
        let mut op = MergeOperation::new("a", "b", MergeStrategy::Union, "m", chrono::Utc::now());
        assert!(transition(&mut op, MergeStatus::Committed).is_err());
        transition(&mut op, MergeStatus::BaseResolved).unwrap();
        assert_eq!(op.status, MergeStatus::BaseResolved);
    }

    #[test]
    fn test_source_mode_change_is_merged() {
        let h = harness(false);
        let f = h.store.put_blob(b"#!/bin/sh\n").unwrap();
        let g = h.store.put_blob(b"g").unwrap();
        let g2 = h.store.put_blob(b"g2").unwrap();
        let commit = |entries: Vec<TreeEntry>, parents: &[Digest]| {
            let tree = h.store.put_tree(entries).unwrap();
            h.store
                .put_commit(tree, parents, &Signature::new("t", "t@x"), "c", chrono::Utc::now())
                .unwrap()
        };

        let root = commit(vec![TreeEntry::blob("f", f), TreeEntry::blob("g", g)], &[]);
        h.branches.create_branch("main", root).unwrap();
        h.branches.fork_branch("feature", "main").unwrap();
        let exec = TreeEntry {
            mode: 0o100755,
            ..TreeEntry::blob("f", f)
        };
        let f1 = commit(vec![exec, TreeEntry::blob("g", g)], &[root]);
        h.branches.advance_branch("feature", f1).unwrap();
        let m1 = commit(vec![TreeEntry::blob("f", f), TreeEntry::blob("g", g2)], &[root]);
        h.branches.advance_branch("main", m1).unwrap();

        let op = h
            .engine
            .merge("feature", "main", MergeStrategy::AbortOnConflict, "")
            .unwrap();
        assert_eq!(op.status, MergeStatus::Committed);
        assert_eq!(op.conflicts.len(), 2);

        let tree = h.store.get_commit(&op.result_commit.unwrap()).unwrap().tree;
        assert_eq!(h.store.read_path(&tree, "f").unwrap().unwrap().mode, 0o100755);
        assert_eq!(h.store.read_path(&tree, "g").unwrap().unwrap().target, g2);
    }

    #[test]
    fn test_deleted_source_is_not_revived_as_merged() {
        let h = harness(false);
        h.forked(&[("a", "1")]);
        let head = h.head("feature");
        h.branches.delete_branch("feature").unwrap();

        h.engine.mark_source_merged("feature", &head);
        assert!(matches!(
            h.branches.get_branch("feature"),
            Err(BranchError::NotFound(_))
        ));
        assert_eq!(
            h.backend.get_branch("feature").unwrap().unwrap().status,
            crate::models::BranchStatus::Deleted
        );
    }

    #[test]
    fn test_unfinished_operation_is_not_logged() {
        let h = harness(false);
        let mut op = MergeOperation::new("a", "b", MergeStrategy::Union, "m", chrono::Utc::now());
        transition(&mut op, MergeStatus::BaseResolved).unwrap();
        let err = h.engine.finish(op).unwrap_err();
        assert!(matches!(err, MergeError::InvalidStateTransition { ref to, .. } if to == "logged"));
        assert!(h.backend.list_merge_operations(10).unwrap().is_empty());
    }
}
