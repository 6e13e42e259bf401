//! Pluggable persistence.
//!
//! A [`Backend`] provides the logical tables the core needs: three
//! append-only object stores keyed by digest, a mutable branch-pointer table,
//! an append-only merge-operation log, and the dependency table. Any store
//! that satisfies this contract can back a repository; two ship with the
//! crate: [`MemoryBackend`] here and the SQLite [`Database`](crate::db::Database).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::digest::Digest;
use crate::errors::DatabaseError;
use crate::models::{Branch, BranchStatus, DependencyEdge, MergeOperation, ObjectKind};

/// Storage contract consumed by the object store, branch manager, dependency
/// tracker and merge engine.
pub trait Backend: Send + Sync {
    /// Store `body` under `digest`. Returns `false` if it was already present.
    fn put_object(
        &self,
        kind: ObjectKind,
        digest: &Digest,
        body: &[u8],
    ) -> Result<bool, DatabaseError>;

    fn get_object(&self, kind: ObjectKind, digest: &Digest)
        -> Result<Option<Vec<u8>>, DatabaseError>;

    fn has_object(&self, kind: ObjectKind, digest: &Digest) -> Result<bool, DatabaseError>;

    fn count_objects(&self, kind: ObjectKind) -> Result<u64, DatabaseError>;

    /// Insert a branch. A deleted branch of the same name is replaced; a live
    /// one is left untouched and `false` is returned.
    fn insert_branch(&self, branch: &Branch) -> Result<bool, DatabaseError>;

    /// Fetch a branch row regardless of status.
    fn get_branch(&self, name: &str) -> Result<Option<Branch>, DatabaseError>;

    /// All branch rows, ordered by name.
    fn list_branches(&self) -> Result<Vec<Branch>, DatabaseError>;

    /// Compare-and-swap the head of a live branch. Returns `false` if the
    /// current head is not `expected`.
    fn update_branch_head(
        &self,
        name: &str,
        expected: &Digest,
        new_head: &Digest,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Compare-and-swap the status of `name`. Succeeds only while the branch
    /// still has status `expected` and head `head`.
    fn set_branch_status(
        &self,
        name: &str,
        expected: BranchStatus,
        head: &Digest,
        status: BranchStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Append a finalized merge operation to the audit log.
    fn append_merge_operation(&self, op: &MergeOperation) -> Result<(), DatabaseError>;

    fn get_merge_operation(&self, id: &str) -> Result<Option<MergeOperation>, DatabaseError>;

    /// Most recent operations first.
    fn list_merge_operations(&self, limit: usize) -> Result<Vec<MergeOperation>, DatabaseError>;

    /// Returns `false` if the edge was already recorded.
    fn insert_dependency(&self, edge: &DependencyEdge) -> Result<bool, DatabaseError>;

    /// Objects that depend on `digest`.
    fn dependents_of(&self, digest: &Digest) -> Result<Vec<Digest>, DatabaseError>;

    /// Objects that `digest` depends on.
    fn dependencies_of(&self, digest: &Digest) -> Result<Vec<Digest>, DatabaseError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryTables {
    objects: HashMap<(ObjectKind, Digest), Vec<u8>>,
    branches: BTreeMap<String, Branch>,
    merge_log: Vec<MergeOperation>,
    edges: BTreeSet<(Digest, Digest)>,
}

/// Backend keeping every table in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<MemoryTables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryTables> {
        self.tables.read().unwrap_or_else(|poisoned| {
            tracing::warn!("memory backend lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryTables> {
        self.tables.write().unwrap_or_else(|poisoned| {
            tracing::warn!("memory backend lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Backend for MemoryBackend {
    fn put_object(
        &self,
        kind: ObjectKind,
        digest: &Digest,
        body: &[u8],
    ) -> Result<bool, DatabaseError> {
        let mut t = self.write();
        if t.objects.contains_key(&(kind, *digest)) {
            return Ok(false);
        }
        t.objects.insert((kind, *digest), body.to_vec());
        Ok(true)
    }

    fn get_object(
        &self,
        kind: ObjectKind,
        digest: &Digest,
    ) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.read().objects.get(&(kind, *digest)).cloned())
    }

    fn has_object(&self, kind: ObjectKind, digest: &Digest) -> Result<bool, DatabaseError> {
        Ok(self.read().objects.contains_key(&(kind, *digest)))
    }

    fn count_objects(&self, kind: ObjectKind) -> Result<u64, DatabaseError> {
        Ok(self.read().objects.keys().filter(|(k, _)| *k == kind).count() as u64)
    }

    fn insert_branch(&self, branch: &Branch) -> Result<bool, DatabaseError> {
        let mut t = self.write();
        if let Some(existing) = t.branches.get(&branch.name) {
            if existing.is_live() {
                return Ok(false);
            }
        }
        t.branches.insert(branch.name.clone(), branch.clone());
        Ok(true)
    }

    fn get_branch(&self, name: &str) -> Result<Option<Branch>, DatabaseError> {
        Ok(self.read().branches.get(name).cloned())
    }

    fn list_branches(&self) -> Result<Vec<Branch>, DatabaseError> {
        Ok(self.read().branches.values().cloned().collect())
    }

    fn update_branch_head(
        &self,
        name: &str,
        expected: &Digest,
        new_head: &Digest,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut t = self.write();
        match t.branches.get_mut(name) {
            Some(b) if b.is_live() && b.head == *expected => {
                b.head = *new_head;
                b.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_branch_status(
        &self,
        name: &str,
        expected: BranchStatus,
        head: &Digest,
        status: BranchStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut t = self.write();
        match t.branches.get_mut(name) {
            Some(b) if b.status == expected && b.head == *head => {
                b.status = status;
                b.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn append_merge_operation(&self, op: &MergeOperation) -> Result<(), DatabaseError> {
        let mut t = self.write();
        if t.merge_log.iter().any(|o| o.id == op.id) {
            return Err(DatabaseError::InvalidRow {
                entity: "merge_operation".into(),
                id: op.id.clone(),
                detail: "operation already recorded".into(),
            });
        }
        t.merge_log.push(op.clone());
        Ok(())
    }

    fn get_merge_operation(&self, id: &str) -> Result<Option<MergeOperation>, DatabaseError> {
        Ok(self.read().merge_log.iter().find(|o| o.id == id).cloned())
    }

    fn list_merge_operations(&self, limit: usize) -> Result<Vec<MergeOperation>, DatabaseError> {
        Ok(self
            .read()
            .merge_log
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn insert_dependency(&self, edge: &DependencyEdge) -> Result<bool, DatabaseError> {
        Ok(self.write().edges.insert((edge.object, edge.depends_on)))
    }

    fn dependents_of(&self, digest: &Digest) -> Result<Vec<Digest>, DatabaseError> {
        Ok(self
            .read()
            .edges
            .iter()
            .filter(|(_, on)| on == digest)
            .map(|(obj, _)| *obj)
            .collect())
    }

    fn dependencies_of(&self, digest: &Digest) -> Result<Vec<Digest>, DatabaseError> {
        Ok(self
            .read()
            .edges
            .iter()
            .filter(|(obj, _)| obj == digest)
            .map(|(_, on)| *on)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Digest {
        Digest::of_bytes(s.as_bytes())
    }

    #[test]
    fn test_put_object_is_idempotent() {
        let b = MemoryBackend::new();
        assert!(b.put_object(ObjectKind::Blob, &d("x"), b"x").unwrap());
        assert!(!b.put_object(ObjectKind::Blob, &d("x"), b"x").unwrap());
        assert_eq!(b.count_objects(ObjectKind::Blob).unwrap(), 1);
        assert!(!b.has_object(ObjectKind::Tree, &d("x")).unwrap());
    }

    #[test]
    fn test_branch_cas() {
        let b = MemoryBackend::new();
        let now = Utc::now();
        assert!(b.insert_branch(&Branch::new("main", d("c1"), None, now)).unwrap());
        assert!(!b.insert_branch(&Branch::new("main", d("c9"), None, now)).unwrap());

        assert!(!b.update_branch_head("main", &d("c0"), &d("c2"), now).unwrap());
        assert!(b.update_branch_head("main", &d("c1"), &d("c2"), now).unwrap());
        assert_eq!(b.get_branch("main").unwrap().unwrap().head, d("c2"));
    }

    #[test]
    fn test_deleted_branch_name_is_reusable() {
        let b = MemoryBackend::new();
        let now = Utc::now();
        b.insert_branch(&Branch::new("topic", d("c1"), None, now)).unwrap();
        b.set_branch_status("topic", BranchStatus::Active, &d("c1"), BranchStatus::Deleted, now)
            .unwrap();
        assert!(!b.update_branch_head("topic", &d("c1"), &d("c2"), now).unwrap());
        assert!(b.insert_branch(&Branch::new("topic", d("c3"), None, now)).unwrap());
        assert_eq!(b.get_branch("topic").unwrap().unwrap().head, d("c3"));
    }

    #[test]
    fn test_status_change_is_compare_and_swap() {
        let b = MemoryBackend::new();
        let now = Utc::now();
        b.insert_branch(&Branch::new("topic", d("c1"), None, now)).unwrap();
        b.set_branch_status("topic", BranchStatus::Active, &d("c1"), BranchStatus::Deleted, now)
            .unwrap();

        // A stale "active" reading must not bring the branch back.
        assert!(!b
            .set_branch_status("topic", BranchStatus::Active, &d("c1"), BranchStatus::Merged, now)
            .unwrap());
        assert_eq!(b.get_branch("topic").unwrap().unwrap().status, BranchStatus::Deleted);

        // Nor may it touch a recreated branch at another head.
        b.insert_branch(&Branch::new("topic", d("c3"), None, now)).unwrap();
        assert!(!b
            .set_branch_status("topic", BranchStatus::Active, &d("c1"), BranchStatus::Merged, now)
            .unwrap());
        assert!(b
            .set_branch_status("topic", BranchStatus::Active, &d("c3"), BranchStatus::Merged, now)
            .unwrap());
    }

    #[test]
    fn test_dependency_lookup_both_directions() {
        let b = MemoryBackend::new();
        let edge = DependencyEdge {
            object: d("view"),
            depends_on: d("table"),
        };
        assert!(b.insert_dependency(&edge).unwrap());
        assert!(!b.insert_dependency(&edge).unwrap());
        assert_eq!(b.dependents_of(&d("table")).unwrap(), vec![d("view")]);
        assert_eq!(b.dependencies_of(&d("view")).unwrap(), vec![d("table")]);
        assert!(b.dependents_of(&d("view")).unwrap().is_empty());
    }
}
