//! Deterministic content hashing of property values using blake3.
//!
//! A [`PropertySnapshot`] records, for a chosen set of keys, the hash of
//! each value at read time. Comparing it against a later read tells which
//! of those keys were rewritten in between, without holding a copy of the
//! values themselves.
//!
//! # Determinism
//!
//! Values are serialized with `serde_json::to_vec`. `serde_json::Value`
//! objects are backed by an ordered map, so equal values always produce
//! equal bytes.

use std::collections::BTreeMap;

use serde_json::Value;

use geosync_core::feature::{Feature, Properties};
use geosync_core::id::FeatureId;

/// Computes a blake3 hash of a JSON value.
pub fn hash_value(value: &Value) -> blake3::Hash {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    blake3::hash(&bytes)
}

/// Hash of a key's value, `None` when the key is absent from the bag.
pub fn hash_key(properties: &Properties, key: &str) -> Option<blake3::Hash> {
    properties.get(key).map(hash_value)
}

/// Per-key value hashes of a feature taken at a given version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySnapshot {
    pub feature: FeatureId,
    pub version: u64,
    hashes: BTreeMap<String, Option<blake3::Hash>>,
}

impl PropertySnapshot {
    /// Snapshots `keys` of `feature`.
    pub fn capture<'a, I>(feature: &Feature, keys: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let hashes = keys
            .into_iter()
            .map(|key| (key.to_string(), hash_key(&feature.properties, key)))
            .collect();
        PropertySnapshot {
            feature: feature.id,
            version: feature.version,
            hashes,
        }
    }

    /// The hash recorded for `key`; `None` if the key was absent or not
    /// part of the snapshot.
    pub fn hash_of(&self, key: &str) -> Option<blake3::Hash> {
        self.hashes.get(key).copied().flatten()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.hashes.keys().map(String::as_str)
    }

    /// True if `key`'s value in `current` differs from the snapshot.
    pub fn key_changed(&self, key: &str, current: &Properties) -> bool {
        match self.hashes.get(key) {
            Some(recorded) => *recorded != hash_key(current, key),
            None => false,
        }
    }

    /// Snapshot keys whose values differ in `current`, in key order.
    pub fn changed_keys(&self, current: &Properties) -> Vec<String> {
        self.hashes
            .keys()
            .filter(|key| self.key_changed(key, current))
            .cloned()
            .collect()
    }
}
