//! Optimistic concurrency guard for computed-property write-back.
//!
//! At base read the guard records a blake3 hash per computed key it may
//! write. Before write-back it compares those hashes with the latest
//! persisted state. A key conflicts when another writer changed it since
//! the base read *and* left it at a value different from this
//! invocation's candidate. Keys nobody else touched, and keys some other
//! writer already set to the same candidate, are safe. Keys the guard does
//! not write never conflict, so non-overlapping writers both succeed.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use geosync_core::feature::Feature;
use geosync_storage::hash::{hash_key, PropertySnapshot};

/// Lifecycle of one guarded recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    BaseRead,
    CandidatesComputed,
    Committed,
    AbortedGone,
    AbortedConflict,
}

impl GuardState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GuardState::Committed | GuardState::AbortedGone | GuardState::AbortedConflict
        )
    }
}

/// A key changed by someone else since the base read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyConflict {
    pub key: String,
    /// Hex hash at base read; `None` if the key was absent.
    pub expected_hash: Option<String>,
    /// Hex hash now persisted; `None` if the key is now absent.
    pub current_hash: Option<String>,
}

/// What the re-read found.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Feature deleted since the base read.
    Gone,
    /// At least one key this invocation writes was changed concurrently.
    Conflict(Vec<KeyConflict>),
    /// Safe to write these keys (possibly none) onto the latest state.
    Clean(BTreeMap<String, Value>),
}

#[derive(Debug)]
pub struct ConcurrencyGuard {
    snapshot: PropertySnapshot,
    candidates: BTreeMap<String, Value>,
    state: GuardState,
}

impl ConcurrencyGuard {
    /// Takes the base snapshot of `keys` on `base`.
    pub fn begin<'a, I>(base: &Feature, keys: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        ConcurrencyGuard {
            snapshot: PropertySnapshot::capture(base, keys),
            candidates: BTreeMap::new(),
            state: GuardState::BaseRead,
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    /// Records the candidate values. Keys outside the snapshot are ignored:
    /// the guard only writes what it has a base hash for.
    pub fn set_candidates(&mut self, candidates: BTreeMap<String, Value>) {
        debug_assert_eq!(self.state, GuardState::BaseRead);
        self.candidates = candidates
            .into_iter()
            .filter(|(key, _)| self.snapshot.keys().any(|k| k == key))
            .collect();
        self.state = GuardState::CandidatesComputed;
    }

    pub fn candidates(&self) -> &BTreeMap<String, Value> {
        &self.candidates
    }

    /// Checks the candidates against the latest persisted state.
    ///
    /// May be called repeatedly (once per compare-and-save attempt). Moves
    /// the guard to a terminal abort state on `Gone` or `Conflict`.
    pub fn verify(&mut self, latest: Option<&Feature>) -> Verdict {
        debug_assert!(!self.state.is_terminal());
        let Some(latest) = latest else {
            self.state = GuardState::AbortedGone;
            return Verdict::Gone;
        };

        let mut conflicts = Vec::new();
        let mut writes = BTreeMap::new();
        for (key, candidate) in &self.candidates {
            let current = latest.properties.get(key);
            if current == Some(candidate) {
                continue;
            }
            if self.snapshot.key_changed(key, &latest.properties) {
                conflicts.push(KeyConflict {
                    key: key.clone(),
                    expected_hash: self.snapshot.hash_of(key).map(|h| h.to_hex().to_string()),
                    current_hash: hash_key(&latest.properties, key).map(|h| h.to_hex().to_string()),
                });
                continue;
            }
            writes.insert(key.clone(), candidate.clone());
        }

        if conflicts.is_empty() {
            Verdict::Clean(writes)
        } else {
            self.state = GuardState::AbortedConflict;
            Verdict::Conflict(conflicts)
        }
    }

    /// Marks the write-back done.
    pub fn commit(&mut self) {
        self.state = GuardState::Committed;
    }

    /// Marks the feature gone (deleted between verify and write).
    pub fn abort_gone(&mut self) {
        self.state = GuardState::AbortedGone;
    }

    /// Marks the guard conflicted without a key-level verdict (write-back
    /// attempts exhausted).
    pub fn abort_conflict(&mut self) {
        self.state = GuardState::AbortedConflict;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosync_core::feature::Properties;
    use geosync_core::geometry::Geometry;
    use geosync_core::id::{FeatureId, LayerId};
    use serde_json::json;

    fn feature(props: Properties, version: u64) -> Feature {
        Feature {
            id: FeatureId(1),
            layer: LayerId(1),
            geometry: Geometry::point(0.0, 0.0),
            properties: props,
            version,
        }
    }

    fn guard_with(base: &Feature, candidates: &[(&str, Value)]) -> ConcurrencyGuard {
        let mut guard = ConcurrencyGuard::begin(base, candidates.iter().map(|(k, _)| *k));
        guard.set_candidates(
            candidates
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        guard
    }

    #[test]
    fn untouched_keys_are_written() {
        let base = feature(Properties::new().with("length", json!(0.5)), 1);
        let mut guard = guard_with(&base, &[("length", json!(1.0))]);
        assert_eq!(guard.state(), GuardState::CandidatesComputed);

        // Unrelated key changed concurrently: still clean.
        let latest = feature(base.properties.with("name", json!("x")), 2);
        let verdict = guard.verify(Some(&latest));
        assert_eq!(
            verdict,
            Verdict::Clean(BTreeMap::from([("length".to_string(), json!(1.0))]))
        );
        guard.commit();
        assert_eq!(guard.state(), GuardState::Committed);
    }

    #[test]
    fn concurrently_changed_key_conflicts() {
        let base = feature(Properties::new().with("length", json!(0.5)), 1);
        let mut guard = guard_with(&base, &[("length", json!(1.0))]);
        let latest = feature(Properties::new().with("length", json!(99)), 2);
        match guard.verify(Some(&latest)) {
            Verdict::Conflict(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].key, "length");
                assert_ne!(conflicts[0].expected_hash, conflicts[0].current_hash);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(guard.state(), GuardState::AbortedConflict);
    }

    #[test]
    fn converged_duplicate_is_not_a_conflict() {
        let base = feature(Properties::new(), 1);
        let mut guard = guard_with(&base, &[("length", json!(1.0))]);
        // Another recomputation already wrote the same value.
        let latest = feature(Properties::new().with("length", json!(1.0)), 2);
        assert_eq!(guard.verify(Some(&latest)), Verdict::Clean(BTreeMap::new()));
    }

    #[test]
    fn deleted_feature_is_gone() {
        let base = feature(Properties::new(), 1);
        let mut guard = guard_with(&base, &[("length", json!(1.0))]);
        assert_eq!(guard.verify(None), Verdict::Gone);
        assert_eq!(guard.state(), GuardState::AbortedGone);
        assert!(guard.state().is_terminal());
    }

    #[test]
    fn removed_key_counts_as_change() {
        let base = feature(Properties::new().with("length", json!(2.0)), 1);
        let mut guard = guard_with(&base, &[("length", json!(1.0))]);
        let latest = feature(Properties::new(), 2);
        assert!(matches!(guard.verify(Some(&latest)), Verdict::Conflict(_)));
    }

    #[test]
    fn candidates_outside_snapshot_are_dropped() {
        let base = feature(Properties::new(), 1);
        let mut guard = ConcurrencyGuard::begin(&base, ["length"]);
        guard.set_candidates(BTreeMap::from([
            ("length".to_string(), json!(1.0)),
            ("other".to_string(), json!(2.0)),
        ]));
        assert_eq!(guard.candidates().len(), 1);
    }
}
