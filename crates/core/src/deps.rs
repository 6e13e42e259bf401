//! Dependency tracking between stored objects.
//!
//! An edge `object -> depends_on` says that `object` refers to
//! `depends_on`. Edges never block store writes. They are consulted while
//! classifying conflicts, where deleting something that live objects still
//! depend on raises severity and disables automatic resolution.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::digest::Digest;
use crate::errors::StoreError;
use crate::models::DependencyEdge;

/// Lookup table over dependency edges.
#[derive(Clone)]
pub struct DependencyTracker {
    backend: Arc<dyn Backend>,
}

impl DependencyTracker {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Record that `object` depends on `depends_on`. Returns `false` if the
    /// edge was already known.
    pub fn record_dependency(&self, object: Digest, depends_on: Digest) -> Result<bool, StoreError> {
        let inserted = self
            .backend
            .insert_dependency(&DependencyEdge { object, depends_on })?;
        if inserted {
            debug!(
                object = %object.short(),
                depends_on = %depends_on.short(),
                "recorded dependency"
            );
        }
        Ok(inserted)
    }

    /// Objects that depend on `digest`.
    pub fn find_dependents(&self, digest: &Digest) -> Result<Vec<Digest>, StoreError> {
        Ok(self.backend.dependents_of(digest)?)
    }

    /// Objects `digest` depends on.
    pub fn find_dependencies(&self, digest: &Digest) -> Result<Vec<Digest>, StoreError> {
        Ok(self.backend.dependencies_of(digest)?)
    }

    /// Dependents of any digest in `removed` that are still present in
    /// `live` and are not themselves being removed. Sorted, without
    /// duplicates.
    pub fn live_dependents(
        &self,
        removed: &HashSet<Digest>,
        live: &HashSet<Digest>,
    ) -> Result<Vec<Digest>, StoreError> {
        let mut found = BTreeSet::new();
        for digest in removed {
            for dependent in self.backend.dependents_of(digest)? {
                if live.contains(&dependent) && !removed.contains(&dependent) {
                    found.insert(dependent);
                }
            }
        }
        Ok(found.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn d(s: &str) -> Digest {
        Digest::of_bytes(s.as_bytes())
    }

    fn tracker() -> DependencyTracker {
        DependencyTracker::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn test_record_is_idempotent() {
        let deps = tracker();
        assert!(deps.record_dependency(d("b"), d("a")).unwrap());
        assert!(!deps.record_dependency(d("b"), d("a")).unwrap());
        assert_eq!(deps.find_dependents(&d("a")).unwrap(), vec![d("b")]);
        assert_eq!(deps.find_dependencies(&d("b")).unwrap(), vec![d("a")]);
    }

    #[test]
    fn test_unknown_object_has_no_edges() {
        let deps = tracker();
        assert!(deps.find_dependents(&d("x")).unwrap().is_empty());
    }

    #[test]
    fn test_live_dependents_filters() {
        let deps = tracker();
        deps.record_dependency(d("b"), d("a")).unwrap();
        deps.record_dependency(d("c"), d("a")).unwrap();
        deps.record_dependency(d("inner"), d("a")).unwrap();

        let removed: HashSet<Digest> = [d("a"), d("inner")].into_iter().collect();
        // "c" no longer exists anywhere; "inner" goes away with "a".
        let live: HashSet<Digest> = [d("b"), d("inner")].into_iter().collect();

        assert_eq!(deps.live_dependents(&removed, &live).unwrap(), vec![d("b")]);
    }
}
