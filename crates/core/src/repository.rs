//! Repository facade.
//!
//! [`Repository`] wires the object store, branch manager, ancestry resolver,
//! dependency tracker, classifier and merge engine over one backend and
//! exposes them as a single library surface. Branch names are passed on
//! every call; there is no "current branch".

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::ancestry::AncestryResolver;
use crate::backend::{Backend, MemoryBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::{ArborConfig, StorageBackend};
use crate::conflict::{Conflict, ConflictClassifier, Resolution};
use crate::db::Database;
use crate::deps::DependencyTracker;
use crate::digest::Digest;
use crate::errors::{AncestryError, BranchError, CoreError, MergeError, StoreError};
use crate::merge::MergeEngine;
use crate::models::{Branch, Commit, MergeOperation, MergeStrategy, Signature, Tree, TreeEntry};
use crate::refs::BranchManager;
use crate::store::ObjectStore;

/// A version-controlled object repository.
pub struct Repository {
    config: ArborConfig,
    store: ObjectStore,
    branches: Arc<BranchManager>,
    ancestry: AncestryResolver,
    deps: DependencyTracker,
    classifier: ConflictClassifier,
    engine: MergeEngine,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Open a repository with the backend named in `config`.
    pub fn open(config: ArborConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let backend: Arc<dyn Backend> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryBackend::new()),
            StorageBackend::Sqlite => {
                let db = Database::new(&config.storage.path)?;
                db.initialize()?;
                Arc::new(db)
            }
        };
        info!(backend = ?config.storage.backend, "opening repository");
        Self::with_backend(config, backend, Arc::new(SystemClock))
    }

    /// In-memory repository with default configuration.
    pub fn in_memory() -> Result<Self, CoreError> {
        Self::open(ArborConfig::default())
    }

    /// Build a repository over an existing backend and clock.
    pub fn with_backend(
        config: ArborConfig,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let store = ObjectStore::new(backend.clone());
        let branches = Arc::new(BranchManager::new(
            store.clone(),
            clock.clone(),
            config.branches.default_branch.clone(),
            config.branches.lock_timeout(),
        ));
        let ancestry = AncestryResolver::new(store.clone(), config.ancestry.max_traversal);
        let deps = DependencyTracker::new(backend);
        let classifier = ConflictClassifier::new(
            store.clone(),
            deps.clone(),
            config.merge.structural_patterns.clone(),
        );
        let engine = MergeEngine::new(
            store.clone(),
            branches.clone(),
            ancestry.clone(),
            classifier.clone(),
            clock.clone(),
            config.identity.signature(),
            config.merge.allow_fast_forward,
        );

        Ok(Self {
            config,
            store,
            branches,
            ancestry,
            deps,
            classifier,
            engine,
            clock,
        })
    }

    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Author used for commits the repository writes on its own behalf.
    pub fn identity(&self) -> Signature {
        self.config.identity.signature()
    }

    // -- objects ------------------------------------------------------------

    pub fn put_blob(&self, content: &[u8]) -> Result<Digest, StoreError> {
        self.store.put_blob(content)
    }

    pub fn put_tree(&self, entries: Vec<TreeEntry>) -> Result<Digest, StoreError> {
        self.store.put_tree(entries)
    }

    /// Write a commit stamped with the repository clock.
    pub fn put_commit(
        &self,
        tree: Digest,
        parents: &[Digest],
        author: &Signature,
        message: &str,
    ) -> Result<Digest, StoreError> {
        self.store
            .put_commit(tree, parents, author, message, self.clock.now())
    }

    /// Write a commit with an explicit timestamp.
    pub fn put_commit_at(
        &self,
        tree: Digest,
        parents: &[Digest],
        author: &Signature,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Digest, StoreError> {
        self.store.put_commit(tree, parents, author, message, timestamp)
    }

    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        self.store.get_blob(digest)
    }

    pub fn get_tree(&self, digest: &Digest) -> Result<Tree, StoreError> {
        self.store.get_tree(digest)
    }

    pub fn get_commit(&self, digest: &Digest) -> Result<Commit, StoreError> {
        self.store.get_commit(digest)
    }

    /// Resolve `path` inside the tree of `commit`.
    pub fn read_path(&self, commit: &Digest, path: &str) -> Result<Option<TreeEntry>, StoreError> {
        let tree = self.store.get_commit(commit)?.tree;
        self.store.read_path(&tree, path)
    }

    // -- branches -----------------------------------------------------------

    /// Create the default branch at a root commit of `tree`, unless it
    /// already exists.
    pub fn init_default_branch(&self, tree: Digest, message: &str) -> Result<Branch, CoreError> {
        let name = self.branches.default_branch().to_string();
        match self.branches.get_branch(&name) {
            Ok(branch) => Ok(branch),
            Err(BranchError::NotFound(_)) => {
                let root = self.put_commit(tree, &[], &self.identity(), message)?;
                Ok(self.branches.create_branch(&name, root)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_branch(&self, name: &str, from_commit: Digest) -> Result<Branch, BranchError> {
        self.branches.create_branch(name, from_commit)
    }

    pub fn fork_branch(&self, name: &str, from_branch: &str) -> Result<Branch, BranchError> {
        self.branches.fork_branch(name, from_branch)
    }

    pub fn get_branch(&self, name: &str) -> Result<Branch, BranchError> {
        self.branches.get_branch(name)
    }

    pub fn list_branches(&self) -> Result<Vec<Branch>, BranchError> {
        self.branches.list_branches()
    }

    pub fn delete_branch(&self, name: &str) -> Result<(), BranchError> {
        self.branches.delete_branch(name)
    }

    /// Move a branch to an existing commit.
    ///
    /// No descent check is made; the branch may be moved to any commit.
    pub fn advance_branch(&self, name: &str, new_commit: Digest) -> Result<Branch, BranchError> {
        self.branches.advance_branch(name, new_commit)
    }

    /// Commit `tree` on top of `branch` and advance it.
    pub fn commit(
        &self,
        branch: &str,
        tree: Digest,
        author: &Signature,
        message: &str,
    ) -> Result<Digest, BranchError> {
        let guard = self.branches.lock(branch)?;
        let head = self.branches.get_branch(branch)?.head;
        let commit = self.put_commit(tree, &[head], author, message)?;
        self.branches.advance_locked(&guard, &head, commit)?;
        Ok(commit)
    }

    // -- ancestry -----------------------------------------------------------

    pub fn find_merge_base(&self, a: &Digest, b: &Digest) -> Result<Digest, AncestryError> {
        self.ancestry.find_merge_base(a, b)
    }

    pub fn merge_bases(&self, a: &Digest, b: &Digest) -> Result<Vec<Digest>, AncestryError> {
        self.ancestry.merge_bases(a, b)
    }

    pub fn is_ancestor(&self, ancestor: &Digest, descendant: &Digest) -> Result<bool, AncestryError> {
        self.ancestry.is_ancestor(ancestor, descendant)
    }

    /// History of `branch`, newest first.
    pub fn log(&self, branch: &str, limit: usize) -> Result<Vec<Commit>, CoreError> {
        let head = self.branches.get_branch(branch)?.head;
        Ok(self.ancestry.log(&head, limit)?)
    }

    // -- dependencies -------------------------------------------------------

    pub fn record_dependency(&self, object: Digest, depends_on: Digest) -> Result<bool, StoreError> {
        self.deps.record_dependency(object, depends_on)
    }

    pub fn find_dependents(&self, digest: &Digest) -> Result<Vec<Digest>, StoreError> {
        self.deps.find_dependents(digest)
    }

    // -- classification and merge ---------------------------------------------

    /// Classify two trees against an optional base tree.
    pub fn classify(
        &self,
        source_tree: &Digest,
        target_tree: &Digest,
        base_tree: Option<&Digest>,
    ) -> Result<Vec<Conflict>, StoreError> {
        self.classifier.classify(source_tree, target_tree, base_tree)
    }

    pub fn merge(
        &self,
        source: &str,
        target: &str,
        strategy: MergeStrategy,
        message: &str,
    ) -> Result<MergeOperation, MergeError> {
        self.engine.merge(source, target, strategy, message)
    }

    /// Merge with the configured default strategy.
    pub fn merge_default(
        &self,
        source: &str,
        target: &str,
        message: &str,
    ) -> Result<MergeOperation, MergeError> {
        self.engine
            .merge(source, target, self.config.merge.default_strategy, message)
    }

    pub fn complete_manual(
        &self,
        op: &MergeOperation,
        resolutions: Vec<(String, Resolution)>,
    ) -> Result<MergeOperation, MergeError> {
        self.engine.complete_manual(op, resolutions)
    }

    pub fn get_merge_operation(&self, id: &str) -> Result<Option<MergeOperation>, StoreError> {
        Ok(self.store.backend().get_merge_operation(id)?)
    }

    /// Most recent merge operations first.
    pub fn list_merge_operations(&self, limit: usize) -> Result<Vec<MergeOperation>, StoreError> {
        Ok(self.store.backend().list_merge_operations(limit)?)
    }
}
