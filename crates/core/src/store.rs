//! Content-addressed object store.
//!
//! [`ObjectStore`] writes blobs, trees and commits under the digest of their
//! canonical encoding. Writes are pure functions of content: re-submitting
//! identical content yields the same digest and stores nothing new, so a
//! write retried after a crash is always safe. Reads re-verify the digest.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::backend::Backend;
use crate::digest::Digest;
use crate::errors::{DatabaseError, StoreError};
use crate::models::{Commit, EntryKind, ObjectKind, Signature, Tree, TreeEntry};

/// Handle to the three object stores of a backend. Cheap to clone.
#[derive(Clone)]
pub struct ObjectStore {
    backend: Arc<dyn Backend>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // -- blobs --------------------------------------------------------------

    /// Store `content` and return its digest. Identical content is stored once.
    pub fn put_blob(&self, content: &[u8]) -> Result<Digest, StoreError> {
        let digest = Digest::of_object(ObjectKind::Blob.as_str(), content);
        let inserted = self.backend.put_object(ObjectKind::Blob, &digest, content)?;
        trace!(digest = %digest.short(), inserted, "put blob");
        Ok(digest)
    }

    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let body = self.fetch(ObjectKind::Blob, digest)?;
        if Digest::of_object(ObjectKind::Blob.as_str(), &body) != *digest {
            return Err(StoreError::Corrupt {
                digest: *digest,
                detail: "blob content does not match its digest".into(),
            });
        }
        Ok(body)
    }

    pub fn has_blob(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(self.backend.has_object(ObjectKind::Blob, digest)?)
    }

    // -- trees --------------------------------------------------------------

    /// Validate, sort and store a tree.
    ///
    /// Every entry must name an existing object of its declared kind, or the
    /// write fails with [`StoreError::DanglingReference`].
    pub fn put_tree(&self, entries: Vec<TreeEntry>) -> Result<Digest, StoreError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            validate_entry_name(&entry.name)?;
            if !seen.insert(entry.name.as_str()) {
                return Err(StoreError::InvalidEntryName(entry.name.clone()));
            }
            if !self.backend.has_object(entry.kind.object_kind(), &entry.target)? {
                return Err(StoreError::DanglingReference {
                    name: entry.name.clone(),
                    kind: entry.kind.object_kind(),
                    digest: entry.target,
                });
            }
        }

        let tree = Tree::new(entries);
        let digest = tree.digest();
        let body = serde_json::to_vec(&tree).map_err(DatabaseError::from)?;
        let inserted = self.backend.put_object(ObjectKind::Tree, &digest, &body)?;
        trace!(digest = %digest.short(), entries = tree.entries.len(), inserted, "put tree");
        Ok(digest)
    }

    pub fn get_tree(&self, digest: &Digest) -> Result<Tree, StoreError> {
        let body = self.fetch(ObjectKind::Tree, digest)?;
        let tree: Tree = serde_json::from_slice(&body).map_err(|e| StoreError::Corrupt {
            digest: *digest,
            detail: e.to_string(),
        })?;
        if tree.digest() != *digest {
            return Err(StoreError::Corrupt {
                digest: *digest,
                detail: "tree entries do not match their digest".into(),
            });
        }
        Ok(tree)
    }

    pub fn has_tree(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(self.backend.has_object(ObjectKind::Tree, digest)?)
    }

    /// The empty tree, stored on first use.
    pub fn empty_tree(&self) -> Result<Digest, StoreError> {
        self.put_tree(Vec::new())
    }

    // -- commits ------------------------------------------------------------

    /// Store a commit. The tree and every parent must already exist.
    pub fn put_commit(
        &self,
        tree: Digest,
        parents: &[Digest],
        author: &Signature,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Digest, StoreError> {
        if !self.has_tree(&tree)? {
            return Err(StoreError::ObjectNotFound {
                kind: ObjectKind::Tree,
                digest: tree,
            });
        }
        for parent in parents {
            if !self.has_commit(parent)? {
                return Err(StoreError::ObjectNotFound {
                    kind: ObjectKind::Commit,
                    digest: *parent,
                });
            }
        }

        let commit = Commit::new(tree, parents.to_vec(), author.clone(), message, timestamp);
        let body = serde_json::to_vec(&commit).map_err(DatabaseError::from)?;
        let inserted = self
            .backend
            .put_object(ObjectKind::Commit, &commit.digest, &body)?;
        debug!(
            digest = %commit.digest.short(),
            tree = %tree.short(),
            parents = parents.len(),
            inserted,
            "put commit"
        );
        Ok(commit.digest)
    }

    pub fn get_commit(&self, digest: &Digest) -> Result<Commit, StoreError> {
        let body = self.fetch(ObjectKind::Commit, digest)?;
        let commit: Commit = serde_json::from_slice(&body).map_err(|e| StoreError::Corrupt {
            digest: *digest,
            detail: e.to_string(),
        })?;
        if commit.digest != *digest || commit.recompute_digest() != *digest {
            return Err(StoreError::Corrupt {
                digest: *digest,
                detail: "commit fields do not match their digest".into(),
            });
        }
        Ok(commit)
    }

    pub fn has_commit(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(self.backend.has_object(ObjectKind::Commit, digest)?)
    }

    // -- traversal helpers --------------------------------------------------

    /// Resolve a slash-separated path inside `tree`.
    pub fn read_path(&self, tree: &Digest, path: &str) -> Result<Option<TreeEntry>, StoreError> {
        let mut current = self.get_tree(tree)?;
        let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
        while let Some(part) = parts.next() {
            let Some(entry) = current.get(part).cloned() else {
                return Ok(None);
            };
            if parts.peek().is_none() {
                return Ok(Some(entry));
            }
            if !entry.is_tree() {
                return Ok(None);
            }
            current = self.get_tree(&entry.target)?;
        }
        Ok(None)
    }

    /// Every blob under `tree`, keyed by its full path.
    pub fn flatten(&self, tree: &Digest) -> Result<BTreeMap<String, Digest>, StoreError> {
        let mut out = BTreeMap::new();
        self.flatten_into(tree, "", &mut out)?;
        Ok(out)
    }

    fn flatten_into(
        &self,
        tree: &Digest,
        prefix: &str,
        out: &mut BTreeMap<String, Digest>,
    ) -> Result<(), StoreError> {
        for entry in self.get_tree(tree)?.entries {
            let path = join_path(prefix, &entry.name);
            match entry.kind {
                EntryKind::Blob => {
                    out.insert(path, entry.target);
                }
                EntryKind::Tree => self.flatten_into(&entry.target, &path, out)?,
            }
        }
        Ok(())
    }

    /// `tree` plus every object reachable from it.
    pub fn reachable(&self, tree: &Digest) -> Result<HashSet<Digest>, StoreError> {
        let mut seen = HashSet::new();
        let mut stack = vec![*tree];
        seen.insert(*tree);
        while let Some(current) = stack.pop() {
            for entry in self.get_tree(&current)?.entries {
                if seen.insert(entry.target) && entry.is_tree() {
                    stack.push(entry.target);
                }
            }
        }
        Ok(seen)
    }

    fn fetch(&self, kind: ObjectKind, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        self.backend
            .get_object(kind, digest)?
            .ok_or(StoreError::ObjectNotFound {
                kind,
                digest: *digest,
            })
    }
}

/// Join a parent path and an entry name with `/`.
pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn validate_entry_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\n', '\t', '\0']);
    if bad {
        return Err(StoreError::InvalidEntryName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tree builder
// ---------------------------------------------------------------------------

enum Node {
    Dir(BTreeMap<String, Node>),
    Leaf(EntryKind, u32, Digest),
}

/// Builds nested trees from slash-separated paths.
///
/// ```ignore
/// let mut builder = TreeBuilder::new(&store);
/// builder.insert_blob("schema/users", b"id int")?;
/// builder.insert_blob("README", b"hello")?;
/// let root = builder.build()?;
/// ```
pub struct TreeBuilder<'a> {
    store: &'a ObjectStore,
    root: BTreeMap<String, Node>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(store: &'a ObjectStore) -> Self {
        Self {
            store,
            root: BTreeMap::new(),
        }
    }

    /// Store `content` as a blob and place it at `path`.
    pub fn insert_blob(&mut self, path: &str, content: &[u8]) -> Result<Digest, StoreError> {
        let digest = self.store.put_blob(content)?;
        self.insert(path, EntryKind::Blob, digest)?;
        Ok(digest)
    }

    /// Place an existing object at `path`, creating intermediate trees.
    pub fn insert(&mut self, path: &str, kind: EntryKind, digest: Digest) -> Result<(), StoreError> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let Some((leaf, dirs)) = parts.split_last() else {
            return Err(StoreError::InvalidEntryName(path.to_string()));
        };

        let mut level = &mut self.root;
        for dir in dirs {
            let node = level
                .entry((*dir).to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            level = match node {
                Node::Dir(children) => children,
                Node::Leaf(..) => return Err(StoreError::InvalidEntryName(path.to_string())),
            };
        }
        if let Some(Node::Dir(_)) = level.get(*leaf) {
            return Err(StoreError::InvalidEntryName(path.to_string()));
        }
        level.insert(
            (*leaf).to_string(),
            Node::Leaf(kind, kind.default_mode(), digest),
        );
        Ok(())
    }

    /// Write every tree bottom-up and return the root digest.
    pub fn build(self) -> Result<Digest, StoreError> {
        write_level(self.store, self.root)
    }
}

fn write_level(store: &ObjectStore, level: BTreeMap<String, Node>) -> Result<Digest, StoreError> {
    let mut entries = Vec::with_capacity(level.len());
    for (name, node) in level {
        let entry = match node {
            Node::Dir(children) => TreeEntry::tree(name, write_level(store, children)?),
            Node::Leaf(kind, mode, target) => TreeEntry {
                name,
                kind,
                mode,
                target,
            },
        };
        entries.push(entry);
    }
    store.put_tree(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn store() -> ObjectStore {
        ObjectStore::new(Arc::new(MemoryBackend::new()))
    }

    fn alice() -> Signature {
        Signature::new("alice", "alice@example.com")
    }

    #[test]
    fn test_put_blob_dedups() {
        let store = store();
        let d1 = store.put_blob(b"same").unwrap();
        let d2 = store.put_blob(b"same").unwrap();
        assert_eq!(d1, d2);
        assert_eq!(store.backend().count_objects(ObjectKind::Blob).unwrap(), 1);
        assert_eq!(store.get_blob(&d1).unwrap(), b"same");
    }

    #[test]
    fn test_put_tree_insertion_order_invariant() {
        let store = store();
        let a = store.put_blob(b"a").unwrap();
        let b = store.put_blob(b"b").unwrap();
        let t1 = store
            .put_tree(vec![TreeEntry::blob("x", a), TreeEntry::blob("y", b)])
            .unwrap();
        let t2 = store
            .put_tree(vec![TreeEntry::blob("y", b), TreeEntry::blob("x", a)])
            .unwrap();
        assert_eq!(t1, t2);
        assert_eq!(store.backend().count_objects(ObjectKind::Tree).unwrap(), 1);
    }

    #[test]
    fn test_put_tree_rejects_dangling_reference() {
        let store = store();
        let missing = Digest::of_bytes(b"nowhere");
        let err = store
            .put_tree(vec![TreeEntry::blob("ghost", missing)])
            .unwrap_err();
        assert!(matches!(err, StoreError::DanglingReference { ref name, .. } if name == "ghost"));
    }

    #[test]
    fn test_put_tree_checks_entry_kind() {
        let store = store();
        let blob = store.put_blob(b"not a tree").unwrap();
        let err = store.put_tree(vec![TreeEntry::tree("dir", blob)]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DanglingReference {
                kind: ObjectKind::Tree,
                ..
            }
        ));
    }

    #[test]
    fn test_put_tree_rejects_bad_names() {
        let store = store();
        let blob = store.put_blob(b"x").unwrap();
        for name in ["", "a/b", "..", "tab\tname"] {
            let err = store.put_tree(vec![TreeEntry::blob(name, blob)]).unwrap_err();
            assert!(matches!(err, StoreError::InvalidEntryName(_)), "{name:?}");
        }
        let err = store
            .put_tree(vec![TreeEntry::blob("dup", blob), TreeEntry::blob("dup", blob)])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntryName(_)));
    }

    #[test]
    fn test_put_commit_validates_references() {
        let store = store();
        let tree = store.empty_tree().unwrap();
        let now = Utc::now();

        let missing = Digest::of_bytes(b"missing");
        let err = store.put_commit(missing, &[], &alice(), "m", now).unwrap_err();
        assert!(matches!(err, StoreError::ObjectNotFound { kind: ObjectKind::Tree, .. }));

        let err = store.put_commit(tree, &[missing], &alice(), "m", now).unwrap_err();
        assert!(matches!(err, StoreError::ObjectNotFound { kind: ObjectKind::Commit, .. }));

        let root = store.put_commit(tree, &[], &alice(), "root", now).unwrap();
        let again = store.put_commit(tree, &[], &alice(), "root", now).unwrap();
        assert_eq!(root, again);
        let child = store.put_commit(tree, &[root], &alice(), "child", now).unwrap();
        assert_eq!(store.get_commit(&child).unwrap().parents, vec![root]);
    }

    #[test]
    fn test_get_missing_object() {
        let store = store();
        let err = store.get_tree(&Digest::of_bytes(b"nope")).unwrap_err();
        assert!(matches!(err, StoreError::ObjectNotFound { kind: ObjectKind::Tree, .. }));
    }

    #[test]
    fn test_corrupt_blob_detected() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ObjectStore::new(backend.clone());
        let digest = Digest::of_object("blob", b"original");
        backend.put_object(ObjectKind::Blob, &digest, b"tampered").unwrap();
        assert!(matches!(store.get_blob(&digest), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_tree_builder_and_read_path() {
        let store = store();
        let mut builder = TreeBuilder::new(&store);
        let users = builder.insert_blob("schema/users", b"id int").unwrap();
        builder.insert_blob("schema/orders", b"id int, user int").unwrap();
        builder.insert_blob("README", b"hello").unwrap();
        let root = builder.build().unwrap();

        let entry = store.read_path(&root, "schema/users").unwrap().unwrap();
        assert_eq!(entry.target, users);
        assert!(store.read_path(&root, "schema").unwrap().unwrap().is_tree());
        assert!(store.read_path(&root, "schema/missing").unwrap().is_none());
        assert!(store.read_path(&root, "README/x").unwrap().is_none());

        let flat = store.flatten(&root).unwrap();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat.get("schema/users"), Some(&users));
        assert!(store.reachable(&root).unwrap().contains(&users));
    }

    #[test]
    fn test_tree_builder_rejects_file_dir_clash() {
        let store = store();
        let mut builder = TreeBuilder::new(&store);
        builder.insert_blob("a", b"file").unwrap();
        assert!(builder.insert_blob("a/b", b"nested").is_err());
    }
}
