//! The computation engine: evaluates a feature's computed properties and
//! writes them back under the [`ConcurrencyGuard`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use geosync_core::feature::{Feature, WriteScope};
use geosync_core::id::FeatureId;
use geosync_core::schema::{CrudView, CrudViewProperty};
use geosync_storage::{FeatureStore, SchemaStore, StorageError, Store};

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::guard::{ConcurrencyGuard, Verdict};
use crate::registry::{ComputeContext, FunctionRegistry};
use crate::unit::PropertySelection;

/// Result of one recomputation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Candidates were written. `previous` is the state the write was
    /// applied onto.
    Success { feature: Feature, previous: Feature },
    /// Every candidate already matched the persisted value (or there was
    /// nothing to compute); nothing was written.
    Unchanged,
    /// The feature does not exist (any more).
    Gone,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

pub struct ComputationEngine {
    store: Arc<dyn Store>,
    registry: Arc<FunctionRegistry>,
    config: EngineConfig,
}

impl ComputationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<FunctionRegistry>,
        config: EngineConfig,
    ) -> Self {
        ComputationEngine {
            store,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Recomputes the selected computed properties of `feature_id`.
    ///
    /// Function failures are per property: the previous value is kept and
    /// a warning logged. A concurrent change to a key being written fails
    /// the whole call with [`SyncError::ConcurrentPropertyModification`].
    pub fn recompute(
        &self,
        feature_id: FeatureId,
        selection: &PropertySelection,
    ) -> Result<Outcome, SyncError> {
        let Some(base) = self.store.find_feature(feature_id)? else {
            debug!(feature = %feature_id, "recompute target gone");
            return Ok(Outcome::Gone);
        };
        let Some(view) = self.store.view_for_layer(base.layer)? else {
            return Ok(Outcome::Unchanged);
        };
        let selected = self.select(&view, selection);
        if selected.is_empty() {
            return Ok(Outcome::Unchanged);
        }

        let mut guard = ConcurrencyGuard::begin(&base, selected.iter().map(|p| p.key.as_str()));
        let candidates = self.evaluate(&base, &selected);
        guard.set_candidates(candidates);

        let max_attempts = self.config.max_cas_attempts.max(1);
        for attempt in 1..=max_attempts {
            let latest = self.store.find_feature(feature_id)?;
            let writes = match guard.verify(latest.as_ref()) {
                Verdict::Gone => {
                    debug!(feature = %feature_id, "feature deleted during recompute");
                    return Ok(Outcome::Gone);
                }
                Verdict::Conflict(conflicts) => {
                    let keys: Vec<String> = conflicts.into_iter().map(|c| c.key).collect();
                    warn!(feature = %feature_id, ?keys, "concurrent modification of computed properties");
                    return Err(SyncError::ConcurrentPropertyModification {
                        feature: feature_id,
                        keys,
                    });
                }
                Verdict::Clean(writes) => writes,
            };
            let Some(latest) = latest else {
                return Ok(Outcome::Gone);
            };
            if writes.is_empty() {
                guard.commit();
                return Ok(Outcome::Unchanged);
            }

            let merged = latest.with_properties(latest.properties.merged_with(&writes));
            match self
                .store
                .compare_and_save(&merged, latest.version, &WriteScope::engine())
            {
                Ok(saved) => {
                    guard.commit();
                    debug!(feature = %feature_id, keys = ?writes.keys().collect::<Vec<_>>(), "computed properties written");
                    return Ok(Outcome::Success {
                        feature: saved,
                        previous: latest,
                    });
                }
                Err(StorageError::VersionMismatch { .. }) => {
                    debug!(feature = %feature_id, attempt, "write-back raced, re-reading");
                }
                Err(StorageError::FeatureNotFound(_)) => {
                    guard.abort_gone();
                    return Ok(Outcome::Gone);
                }
                Err(e) => return Err(e.into()),
            }
        }

        guard.abort_conflict();
        let keys: Vec<String> = guard.candidates().keys().cloned().collect();
        warn!(feature = %feature_id, ?keys, "write-back attempts exhausted");
        Err(SyncError::ConcurrentPropertyModification {
            feature: feature_id,
            keys,
        })
    }

    fn select<'v>(
        &self,
        view: &'v CrudView,
        selection: &PropertySelection,
    ) -> Vec<&'v CrudViewProperty> {
        view.computed_properties()
            .filter(|prop| match selection {
                PropertySelection::All => true,
                PropertySelection::Keys(keys) => keys.contains(&prop.key),
                PropertySelection::RelationalOnly => prop
                    .computed_function()
                    .and_then(|name| self.registry.resolve(name))
                    .is_some_and(|f| f.is_relational()),
            })
            .collect()
    }

    /// Runs the functions of `props` against `feature`. Failed or
    /// ill-typed results are left out.
    fn evaluate(&self, feature: &Feature, props: &[&CrudViewProperty]) -> BTreeMap<String, Value> {
        let ctx = ComputeContext::new(feature, self.store.as_ref());
        let mut candidates = BTreeMap::new();
        for prop in props {
            let Some(name) = prop.computed_function() else {
                continue;
            };
            let Some(function) = self.registry.resolve(name) else {
                warn!(feature = %feature.id, key = %prop.key, function = name, "function not registered");
                continue;
            };
            match function.call(&ctx) {
                Ok(value) => {
                    if let Some(ty) = prop.value_type {
                        if !ty.accepts(&value) {
                            warn!(
                                feature = %feature.id,
                                key = %prop.key,
                                expected = ?ty,
                                "computed value does not match declared type, keeping previous value"
                            );
                            continue;
                        }
                    }
                    candidates.insert(prop.key.clone(), value);
                }
                Err(e) => {
                    warn!(feature = %feature.id, key = %prop.key, error = %e, "function failed, keeping previous value");
                }
            }
        }
        candidates
    }
}
