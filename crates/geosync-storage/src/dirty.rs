//! Property change detection between two versions of a feature.
//!
//! Compares two properties bags key by key (via content hashes) to tell
//! which keys a write added, modified or removed. The scheduler uses this
//! to ignore writes that only touched computed keys.

use std::collections::BTreeSet;

use geosync_core::feature::Properties;

use crate::hash::hash_key;

/// The keys that differ between two properties bags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyDiff {
    /// Keys present only in the new bag.
    pub added: BTreeSet<String>,
    /// Keys present in both with different values.
    pub modified: BTreeSet<String>,
    /// Keys present only in the old bag.
    pub removed: BTreeSet<String>,
}

impl PropertyDiff {
    /// All changed keys (added + modified + removed).
    pub fn changed(&self) -> BTreeSet<&str> {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.removed)
            .map(String::as_str)
            .collect()
    }

    /// Returns true if nothing changed.
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// True if some changed key does not satisfy `is_ignored`.
    pub fn touches_any_except<F>(&self, is_ignored: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        self.changed().into_iter().any(|key| !is_ignored(key))
    }
}

/// Computes the diff from `previous` to `current`.
pub fn diff_properties(previous: &Properties, current: &Properties) -> PropertyDiff {
    let mut diff = PropertyDiff::default();

    for key in current.keys() {
        if !previous.contains_key(key) {
            diff.added.insert(key.to_string());
        } else if hash_key(previous, key) != hash_key(current, key) {
            diff.modified.insert(key.to_string());
        }
    }

    for key in previous.keys() {
        if !current.contains_key(key) {
            diff.removed.insert(key.to_string());
        }
    }

    diff
}
