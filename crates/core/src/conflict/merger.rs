//! Additive line-level combine for the `union` strategy.
//!
//! Uses the `diffy` crate to diff each side against the base. Two versions
//! are combined only when both sides purely inserted lines and the
//! insertions do not touch the same region. Anything that removes or
//! rewrites a base line is left for manual resolution.

use diffy::Line;
use tracing::debug;

/// Stateless text combiner.
pub struct Merger;

impl Merger {
    /// Combine `source` and `target` edits of `base` when both are additive.
    ///
    /// Returns `None` if either side deleted or changed a base line, or if
    /// the insertions overlap.
    pub fn additive_union(base: &str, source: &str, target: &str) -> Option<String> {
        if source == target {
            return Some(source.to_string());
        }
        if !Self::is_additive(base, source) || !Self::is_additive(base, target) {
            debug!("union combine rejected: a side removes base lines");
            return None;
        }
        if source == base {
            return Some(target.to_string());
        }
        if target == base {
            return Some(source.to_string());
        }

        match diffy::merge(base, source, target) {
            Ok(merged) => {
                debug!("union combine succeeded");
                Some(merged)
            }
            Err(_) => {
                debug!("union combine rejected: insertions overlap");
                None
            }
        }
    }

    /// Whether going from `base` to `changed` only inserts lines.
    pub fn is_additive(base: &str, changed: &str) -> bool {
        let patch = diffy::create_patch(base, changed);
        patch
            .hunks()
            .iter()
            .flat_map(|hunk| hunk.lines())
            .all(|line| !matches!(line, Line::Delete(_)))
    }
}
