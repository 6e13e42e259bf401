//! Branch/ref manager.
//!
//! Branches are the only mutable state in a repository. Every head update
//! goes through a per-branch exclusive lock with a bounded wait, and is
//! applied as a compare-and-swap against the head the caller last read, so
//! two merges racing on the same target can never lose an update.
//!
//! # Invariants
//!
//! - A branch head always names a stored commit
//! - The default branch cannot be deleted
//! - At most one live branch per name; deleted names may be reused

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use regex_lite::Regex;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::clock::Clock;
use crate::digest::Digest;
use crate::errors::{BranchError, StoreError};
use crate::models::{Branch, BranchStatus, ObjectKind};
use crate::store::ObjectStore;

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Named exclusive locks, one per branch.
#[derive(Debug)]
pub struct BranchLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
    timeout: Duration,
}

impl BranchLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquire the lock for `branch`, waiting at most the configured timeout.
    pub fn acquire(&self, branch: &str) -> Result<BranchGuard<'_>, BranchError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut held = self.held_set();

        while held.contains(branch) {
            let now = Instant::now();
            if now >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(branch, waited_ms, "branch lock timed out");
                return Err(BranchError::LockTimeout {
                    branch: branch.to_string(),
                    waited_ms,
                });
            }
            held = match self.released.wait_timeout(held, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        held.insert(branch.to_string());
        debug!(branch, "branch lock acquired");
        Ok(BranchGuard {
            locks: self,
            branch: branch.to_string(),
        })
    }

    /// Whether `branch` is currently locked.
    pub fn is_locked(&self, branch: &str) -> bool {
        self.held_set().contains(branch)
    }

    fn release(&self, branch: &str) {
        self.held_set().remove(branch);
        self.released.notify_all();
        debug!(branch, "branch lock released");
    }

    fn held_set(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            warn!("branch lock table was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// RAII guard for a branch lock. Released on drop.
#[derive(Debug)]
pub struct BranchGuard<'a> {
    locks: &'a BranchLocks,
    branch: String,
}

impl BranchGuard<'_> {
    pub fn branch(&self) -> &str {
        &self.branch
    }
}

impl Drop for BranchGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.branch);
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._/-]*$").expect("branch name pattern is valid")
    })
}

/// Check that `name` is usable as a branch name.
pub fn validate_branch_name(name: &str) -> Result<(), BranchError> {
    let ok = name_pattern().is_match(name)
        && !name.contains("..")
        && !name.contains("//")
        && !name.ends_with('/')
        && !name.ends_with('.')
        && !name.ends_with(".lock");
    if ok {
        Ok(())
    } else {
        Err(BranchError::InvalidName(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates, lists, deletes and advances branches.
pub struct BranchManager {
    backend: Arc<dyn Backend>,
    store: ObjectStore,
    clock: Arc<dyn Clock>,
    locks: BranchLocks,
    default_branch: String,
}

impl BranchManager {
    pub fn new(
        store: ObjectStore,
        clock: Arc<dyn Clock>,
        default_branch: impl Into<String>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            backend: store.backend().clone(),
            store,
            clock,
            locks: BranchLocks::new(lock_timeout),
            default_branch: default_branch.into(),
        }
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// Create a branch pointing at `from_commit`.
    pub fn create_branch(&self, name: &str, from_commit: Digest) -> Result<Branch, BranchError> {
        self.insert(name, from_commit, None)
    }

    /// Create a branch at the current head of `from_branch`, recording it as
    /// the new branch's parent.
    pub fn fork_branch(&self, name: &str, from_branch: &str) -> Result<Branch, BranchError> {
        let parent = self.get_branch(from_branch)?;
        self.insert(name, parent.head, Some(parent.name))
    }

    fn insert(
        &self,
        name: &str,
        head: Digest,
        parent_branch: Option<String>,
    ) -> Result<Branch, BranchError> {
        validate_branch_name(name)?;
        if !self.store.has_commit(&head)? {
            return Err(StoreError::ObjectNotFound {
                kind: ObjectKind::Commit,
                digest: head,
            }
            .into());
        }

        let branch = Branch::new(name, head, parent_branch, self.clock.now());
        if !self.backend.insert_branch(&branch)? {
            return Err(BranchError::AlreadyExists(name.to_string()));
        }
        info!(
            branch = name,
            head = %head.short(),
            parent = branch.parent_branch.as_deref().unwrap_or("-"),
            "created branch"
        );
        Ok(branch)
    }

    /// Fetch a live branch.
    pub fn get_branch(&self, name: &str) -> Result<Branch, BranchError> {
        match self.backend.get_branch(name)? {
            Some(branch) if branch.is_live() => Ok(branch),
            _ => Err(BranchError::NotFound(name.to_string())),
        }
    }

    /// All live branches, ordered by name.
    pub fn list_branches(&self) -> Result<Vec<Branch>, BranchError> {
        Ok(self
            .backend
            .list_branches()?
            .into_iter()
            .filter(Branch::is_live)
            .collect())
    }

    /// Mark a branch deleted. Its commits are untouched.
    pub fn delete_branch(&self, name: &str) -> Result<(), BranchError> {
        if name == self.default_branch {
            return Err(BranchError::DefaultBranchProtected(name.to_string()));
        }
        let _guard = self.locks.acquire(name)?;
        // The lock keeps the head still; only `mark_merged` can flip the
        // status underneath, and it does so at most once.
        loop {
            let branch = self.get_branch(name)?;
            if self.backend.set_branch_status(
                name,
                branch.status,
                &branch.head,
                BranchStatus::Deleted,
                self.clock.now(),
            )? {
                break;
            }
        }
        info!(branch = name, "deleted branch");
        Ok(())
    }

    /// Move `name` to `new_commit` under the branch lock.
    pub fn advance_branch(&self, name: &str, new_commit: Digest) -> Result<Branch, BranchError> {
        let guard = self.lock(name)?;
        let current = self.get_branch(name)?;
        self.advance_locked(&guard, &current.head, new_commit)
    }

    /// Take the exclusive lock for `name`. Hold the guard across a
    /// read-modify-write of the branch head.
    pub fn lock(&self, name: &str) -> Result<BranchGuard<'_>, BranchError> {
        self.locks.acquire(name)
    }

    /// Compare-and-swap the head of the guarded branch from `expected` to
    /// `new_commit`.
    pub fn advance_locked(
        &self,
        guard: &BranchGuard<'_>,
        expected: &Digest,
        new_commit: Digest,
    ) -> Result<Branch, BranchError> {
        let name = guard.branch();
        if !self.store.has_commit(&new_commit)? {
            return Err(StoreError::ObjectNotFound {
                kind: ObjectKind::Commit,
                digest: new_commit,
            }
            .into());
        }

        let swapped =
            self.backend
                .update_branch_head(name, expected, &new_commit, self.clock.now())?;
        if !swapped {
            let current = self.get_branch(name)?;
            return Err(BranchError::StaleHead {
                branch: name.to_string(),
                expected: *expected,
                actual: current.head,
            });
        }
        debug!(
            branch = name,
            from = %expected.short(),
            to = %new_commit.short(),
            "advanced branch"
        );
        self.get_branch(name)
    }

    /// Record that `name` has been merged at `head`. The branch stays
    /// usable.
    ///
    /// Returns `false` when the branch is no longer active at `head`: it was
    /// deleted, recreated, advanced, or already marked.
    pub fn mark_merged(&self, name: &str, head: &Digest) -> Result<bool, BranchError> {
        let marked = self.backend.set_branch_status(
            name,
            BranchStatus::Active,
            head,
            BranchStatus::Merged,
            self.clock.now(),
        )?;
        debug!(branch = name, head = %head.short(), marked, "mark merged");
        Ok(marked)
    }

    /// Whether the lock for `name` is currently held.
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks.is_locked(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::SystemClock;
    use crate::models::Signature;
    use chrono::Utc;

    fn setup() -> (BranchManager, ObjectStore, Digest) {
        let store = ObjectStore::new(Arc::new(MemoryBackend::new()));
        let tree = store.empty_tree().unwrap();
        let root = store
            .put_commit(tree, &[], &Signature::new("t", "t@x"), "root", Utc::now())
            .unwrap();
        let manager = BranchManager::new(
            store.clone(),
            Arc::new(SystemClock),
            "main",
            Duration::from_millis(100),
        );
        manager.create_branch("main", root).unwrap();
        (manager, store, root)
    }

    fn child_of(store: &ObjectStore, parent: Digest, msg: &str) -> Digest {
        let tree = store.empty_tree().unwrap();
        store
            .put_commit(tree, &[parent], &Signature::new("t", "t@x"), msg, Utc::now())
            .unwrap()
    }

    #[test]
    fn test_create_and_list() {
        let (manager, _store, root) = setup();
        manager.create_branch("feature/a", root).unwrap();
        let names: Vec<String> = manager
            .list_branches()
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["feature/a".to_string(), "main".to_string()]);
    }

    #[test]
    fn test_create_duplicate_fails() {
        let (manager, _store, root) = setup();
        let err = manager.create_branch("main", root).unwrap_err();
        assert!(matches!(err, BranchError::AlreadyExists(ref n) if n == "main"));
    }

    #[test]
    fn test_create_requires_existing_commit() {
        let (manager, _store, _root) = setup();
        let err = manager
            .create_branch("x", Digest::of_bytes(b"nope"))
            .unwrap_err();
        assert!(matches!(err, BranchError::Store(StoreError::ObjectNotFound { .. })));
    }

    #[test]
    fn test_invalid_names() {
        for bad in ["", "-x", "a..b", "a/", "x.lock", "with space", "a//b"] {
            assert!(validate_branch_name(bad).is_err(), "{bad:?}");
        }
        for good in ["main", "feature/login", "release-1.2", "_tmp"] {
            assert!(validate_branch_name(good).is_ok(), "{good:?}");
        }
    }

    #[test]
    fn test_delete_default_branch_rejected() {
        let (manager, _store, _root) = setup();
        let err = manager.delete_branch("main").unwrap_err();
        assert!(matches!(err, BranchError::DefaultBranchProtected(_)));
    }

    #[test]
    fn test_delete_then_recreate() {
        let (manager, _store, root) = setup();
        manager.create_branch("topic", root).unwrap();
        manager.delete_branch("topic").unwrap();
        assert!(matches!(
            manager.get_branch("topic"),
            Err(BranchError::NotFound(_))
        ));
        assert!(matches!(
            manager.delete_branch("topic"),
            Err(BranchError::NotFound(_))
        ));
        manager.create_branch("topic", root).unwrap();
    }

    #[test]
    fn test_mark_merged_requires_active_branch_at_head() {
        let (manager, store, root) = setup();
        manager.create_branch("topic", root).unwrap();

        // Advanced past the merged commit: left active.
        let next = child_of(&store, root, "more");
        manager.advance_branch("topic", next).unwrap();
        assert!(!manager.mark_merged("topic", &root).unwrap());
        assert_eq!(manager.get_branch("topic").unwrap().status, BranchStatus::Active);

        assert!(manager.mark_merged("topic", &next).unwrap());
        assert_eq!(manager.get_branch("topic").unwrap().status, BranchStatus::Merged);
        assert!(!manager.mark_merged("topic", &next).unwrap());

        // A merged branch can still be deleted, and stays deleted.
        manager.delete_branch("topic").unwrap();
        assert!(!manager.mark_merged("topic", &next).unwrap());
        assert!(matches!(
            manager.get_branch("topic"),
            Err(BranchError::NotFound(_))
        ));
    }

    #[test]
    fn test_fork_records_parent() {
        let (manager, _store, root) = setup();
        let fork = manager.fork_branch("feature", "main").unwrap();
        assert_eq!(fork.parent_branch.as_deref(), Some("main"));
        assert_eq!(fork.created_from, root);
    }

    #[test]
    fn test_advance_branch() {
        let (manager, store, root) = setup();
        let next = child_of(&store, root, "next");
        let branch = manager.advance_branch("main", next).unwrap();
        assert_eq!(branch.head, next);
    }

    #[test]
    fn test_advance_locked_detects_stale_head() {
        let (manager, store, root) = setup();
        let a = child_of(&store, root, "a");
        let b = child_of(&store, root, "b");
        manager.advance_branch("main", a).unwrap();

        let guard = manager.lock("main").unwrap();
        let err = manager.advance_locked(&guard, &root, b).unwrap_err();
        assert!(matches!(err, BranchError::StaleHead { actual, .. } if actual == a));
    }

    #[test]
    fn test_lock_timeout() {
        let (manager, _store, _root) = setup();
        let _held = manager.lock("main").unwrap();
        let err = manager.lock("main").unwrap_err();
        assert!(matches!(err, BranchError::LockTimeout { ref branch, .. } if branch == "main"));
        // Other branches are unaffected.
        assert!(manager.lock("other").is_ok());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let (manager, _store, _root) = setup();
        {
            let _guard = manager.lock("main").unwrap();
            assert!(manager.is_locked("main"));
        }
        assert!(!manager.is_locked("main"));
        assert!(manager.lock("main").is_ok());
    }

    #[test]
    fn test_lock_handoff_between_threads() {
        let locks = Arc::new(BranchLocks::new(Duration::from_secs(5)));
        let guard = locks.acquire("main").unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || locks.acquire("main").map(|_| ()).is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
    }
}
