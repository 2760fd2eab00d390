//! GeoService: the write path.
//!
//! Every mutation of features, relations or views goes through
//! [`GeoService`], which persists it and then calls the
//! [`PropagationScheduler`] explicitly. Propagation runs either inline
//! (`GeoService::inline`) or on a tokio worker pool (`GeoService::queued`).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use geosync_core::feature::{Feature, FeatureField, Properties, WriteScope};
use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId, RelationId};
use geosync_core::relation::{LayerRelation, RelationType};
use geosync_core::schema::CrudView;
use geosync_storage::{
    FeatureStore, PropertySnapshot, RelationStore, SchemaStore, StorageError, Store,
};

use crate::compute::{ComputationEngine, Outcome};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::queue::{InlineQueue, TokioQueue, UnitFailure, UnitHandler};
use crate::registry::FunctionRegistry;
use crate::runner::UnitRunner;
use crate::scheduler::{PropagationScheduler, WrittenFeature};
use crate::unit::PropertySelection;

enum Executor {
    Inline {
        queue: Arc<InlineQueue>,
        // Keeps the weakly bound handler alive.
        _runner: Arc<dyn UnitHandler>,
    },
    Queued(Arc<TokioQueue>),
}

/// The fields and property keys one external write sets. `None` in
/// `properties` removes the key.
#[derive(Debug, Default)]
struct Edit {
    geometry: Option<Geometry>,
    layer: Option<LayerId>,
    properties: BTreeMap<String, Option<Value>>,
}

impl Edit {
    /// What `incoming` changes relative to `stored`, limited to `scope`.
    fn between(stored: &Feature, incoming: &Feature, scope: &WriteScope) -> Self {
        let mut edit = Edit::default();
        if scope.touches(FeatureField::Geometry) && incoming.geometry != stored.geometry {
            edit.geometry = Some(incoming.geometry.clone());
        }
        if scope.touches(FeatureField::Layer) && incoming.layer != stored.layer {
            edit.layer = Some(incoming.layer);
        }
        if scope.touches(FeatureField::Properties) {
            for key in stored.properties.keys().chain(incoming.properties.keys()) {
                let value = incoming.properties.get(key);
                if value != stored.properties.get(key) {
                    edit.properties.insert(key.to_string(), value.cloned());
                }
            }
        }
        edit
    }

    fn apply_to(&self, latest: &Feature) -> Feature {
        let mut properties = latest.properties.clone().into_inner();
        for (key, value) in &self.properties {
            match value {
                Some(value) => properties.insert(key.clone(), value.clone()),
                None => properties.remove(key),
            };
        }
        Feature {
            layer: self.layer.unwrap_or(latest.layer),
            geometry: self.geometry.clone().unwrap_or_else(|| latest.geometry.clone()),
            properties: Properties::from(properties),
            ..latest.clone()
        }
    }

    /// Edited keys another writer changed since `snapshot` to a value other
    /// than the one this edit sets.
    fn conflicting_keys(&self, snapshot: &PropertySnapshot, latest: &Feature) -> Vec<String> {
        snapshot
            .changed_keys(&latest.properties)
            .into_iter()
            .filter(|key| {
                let wanted = self.properties.get(key).and_then(Option::as_ref);
                latest.properties.get(key) != wanted
            })
            .collect()
    }
}

pub struct GeoService {
    store: Arc<dyn Store>,
    registry: Arc<FunctionRegistry>,
    engine: Arc<ComputationEngine>,
    scheduler: Arc<PropagationScheduler>,
    executor: Executor,
    config: EngineConfig,
}

impl GeoService {
    /// Propagation runs synchronously: when a write returns, every unit it
    /// caused has run.
    pub fn inline(
        store: Arc<dyn Store>,
        registry: FunctionRegistry,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let registry = Arc::new(registry);
        let queue = Arc::new(InlineQueue::new(&config));
        let engine = Arc::new(ComputationEngine::new(
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(PropagationScheduler::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
        ));
        let runner: Arc<dyn UnitHandler> = Arc::new(UnitRunner::new(
            store.clone(),
            engine.clone(),
            scheduler.clone(),
        ));
        queue.bind(Arc::downgrade(&runner))?;
        Ok(GeoService {
            store,
            registry,
            engine,
            scheduler,
            executor: Executor::Inline {
                queue,
                _runner: runner,
            },
            config,
        })
    }

    /// Propagation runs on `config.workers` tokio tasks. Must be called
    /// from within a tokio runtime.
    pub fn queued(
        store: Arc<dyn Store>,
        registry: FunctionRegistry,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let registry = Arc::new(registry);
        let queue = Arc::new(TokioQueue::new(config.clone()));
        let engine = Arc::new(ComputationEngine::new(
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(PropagationScheduler::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
        ));
        let runner = Arc::new(UnitRunner::new(store.clone(), engine.clone(), scheduler.clone()));
        queue.start(runner)?;
        Ok(GeoService {
            store,
            registry,
            engine,
            scheduler,
            executor: Executor::Queued(queue),
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &PropagationScheduler {
        &self.scheduler
    }

    // -------------------------------------------------------------------
    // Schema
    // -------------------------------------------------------------------

    pub fn create_layer(&self, name: &str) -> Result<LayerId, SyncError> {
        Ok(self.store.create_layer(name)?)
    }

    /// Registers a view after checking every function it names exists,
    /// then recomputes the layer.
    pub fn register_view(&self, view: &CrudView) -> Result<(), SyncError> {
        self.registry.validate_view(view)?;
        self.store.register_view(view)?;
        info!(view = %view.id, layer = %view.layer, "view registered");
        self.propagate("view registration", || self.scheduler.on_view_registered(view.layer));
        Ok(())
    }

    // -------------------------------------------------------------------
    // Features
    // -------------------------------------------------------------------

    pub fn feature(&self, id: FeatureId) -> Result<Feature, SyncError> {
        Ok(self.store.get_feature(id)?)
    }

    pub fn create_feature(
        &self,
        layer: LayerId,
        geometry: Geometry,
        properties: Properties,
    ) -> Result<Feature, SyncError> {
        geometry.validate()?;
        let feature = self.store.insert_feature(layer, geometry, properties)?;
        self.propagate("feature creation", || {
            self.scheduler.on_feature_written(&WrittenFeature::created(feature.clone()))
        });
        Ok(feature)
    }

    /// Saves the fields of `feature` covered by `scope`.
    ///
    /// Only the fields and property keys that differ from the stored
    /// feature are written. A concurrent write to other keys is merged; a
    /// concurrent write that changed one of the same keys to a different
    /// value fails with [`SyncError::ConcurrentPropertyModification`].
    pub fn update_feature(
        &self,
        feature: &Feature,
        scope: WriteScope,
    ) -> Result<Feature, SyncError> {
        if scope.touches(FeatureField::Geometry) {
            feature.geometry.validate()?;
        }
        let base = self.store.get_feature(feature.id)?;
        let edit = Edit::between(&base, feature, &scope);
        self.apply_edit(base, &edit, scope)
    }

    /// Replaces the geometry only.
    pub fn update_geometry(&self, id: FeatureId, geometry: Geometry) -> Result<Feature, SyncError> {
        geometry.validate()?;
        let base = self.store.get_feature(id)?;
        let edit = Edit {
            geometry: Some(geometry),
            ..Edit::default()
        };
        self.apply_edit(base, &edit, WriteScope::fields([FeatureField::Geometry]))
    }

    /// Merges `updates` into the properties bag; other keys are kept.
    pub fn update_properties(
        &self,
        id: FeatureId,
        updates: &BTreeMap<String, Value>,
    ) -> Result<Feature, SyncError> {
        let base = self.store.get_feature(id)?;
        let edit = Edit {
            properties: updates
                .iter()
                .map(|(key, value)| (key.clone(), Some(value.clone())))
                .collect(),
            ..Edit::default()
        };
        self.apply_edit(base, &edit, WriteScope::fields([FeatureField::Properties]))
    }

    /// Compare-and-save loop of the external write path. `base` is the
    /// state the caller's edit was made against.
    fn apply_edit(
        &self,
        base: Feature,
        edit: &Edit,
        scope: WriteScope,
    ) -> Result<Feature, SyncError> {
        let id = base.id;
        let snapshot = PropertySnapshot::capture(&base, edit.properties.keys().map(String::as_str));
        let mut latest = base;
        for attempt in 1..=self.config.max_cas_attempts.max(1) {
            let next = edit.apply_to(&latest);
            match self.store.compare_and_save(&next, latest.version, &scope) {
                Ok(saved) => {
                    let written = WrittenFeature::updated(saved.clone(), latest, scope);
                    self.propagate("feature update", || self.scheduler.on_feature_written(&written));
                    return Ok(saved);
                }
                Err(StorageError::VersionMismatch { .. }) => {
                    debug!(feature = %id, attempt, "feature update raced, re-reading");
                    latest = self.store.get_feature(id)?;
                    let keys = edit.conflicting_keys(&snapshot, &latest);
                    if !keys.is_empty() {
                        warn!(feature = %id, ?keys, "concurrent modification of edited properties");
                        return Err(SyncError::ConcurrentPropertyModification { feature: id, keys });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(feature = %id, "feature update attempts exhausted");
        Err(SyncError::ConcurrentPropertyModification {
            feature: id,
            keys: edit.properties.keys().cloned().collect(),
        })
    }

    /// Deletes a feature and lets features related to it drop it.
    pub fn delete_feature(&self, id: FeatureId) -> Result<Feature, SyncError> {
        let deleted = self.store.delete_feature(id)?;
        self.propagate("feature deletion", || self.scheduler.on_feature_deleted(&deleted));
        Ok(deleted)
    }

    // -------------------------------------------------------------------
    // Relations
    // -------------------------------------------------------------------

    pub fn create_relation(
        &self,
        name: &str,
        origin: LayerId,
        destination: LayerId,
        relation_type: RelationType,
    ) -> Result<LayerRelation, SyncError> {
        let relation = self
            .store
            .create_relation(name, origin, destination, relation_type)?;
        self.propagate("relation creation", || {
            self.scheduler.on_relation_changed(&relation, None)
        });
        Ok(relation)
    }

    /// Replaces a relation's definition and recomputes every layer it
    /// touched before or touches now.
    pub fn update_relation(&self, relation: &LayerRelation) -> Result<LayerRelation, SyncError> {
        let previous = self.store.get_relation(relation.id)?;
        let updated = self.store.update_relation(relation)?;
        self.propagate("relation update", || {
            self.scheduler.on_relation_changed(&updated, Some(&previous))
        });
        Ok(updated)
    }

    pub fn delete_relation(&self, id: RelationId) -> Result<LayerRelation, SyncError> {
        let deleted = self.store.delete_relation(id)?;
        self.propagate("relation deletion", || self.scheduler.on_relation_deleted(&deleted));
        Ok(deleted)
    }

    /// Re-runs the relation cascade without changing the relation.
    pub fn refresh_relation(&self, id: RelationId) -> Result<usize, SyncError> {
        let relation = self.store.get_relation(id)?;
        self.scheduler.on_relation_changed(&relation, None)
    }

    // -------------------------------------------------------------------
    // Direct recomputation
    // -------------------------------------------------------------------

    /// Recomputes a feature synchronously, bypassing the queue. A
    /// successful write still propagates to related features.
    pub fn recompute(
        &self,
        id: FeatureId,
        selection: &PropertySelection,
    ) -> Result<Outcome, SyncError> {
        let outcome = self.engine.recompute(id, selection)?;
        if let Outcome::Success { feature, previous } = &outcome {
            self.propagate("recompute", || {
                self.scheduler.on_feature_written(&WrittenFeature::updated(
                    feature.clone(),
                    previous.clone(),
                    WriteScope::engine(),
                ))
            });
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------
    // Executor
    // -------------------------------------------------------------------

    /// Waits until all scheduled propagation has run. Immediate for the
    /// inline executor.
    pub async fn settle(&self) {
        if let Executor::Queued(queue) = &self.executor {
            queue.wait_idle().await;
        }
    }

    /// Units that failed permanently since the last call.
    pub fn take_failures(&self) -> Vec<UnitFailure> {
        match &self.executor {
            Executor::Inline { queue, .. } => queue.take_failures(),
            Executor::Queued(queue) => queue.take_failures(),
        }
    }

    /// Drains and stops the queued executor.
    pub async fn shutdown(&self) {
        if let Executor::Queued(queue) = &self.executor {
            queue.shutdown().await;
        }
    }

    /// The write has committed; scheduling failures are logged, not
    /// returned.
    fn propagate<F>(&self, what: &str, schedule: F)
    where
        F: FnOnce() -> Result<usize, SyncError>,
    {
        if let Err(e) = schedule() {
            warn!(error = %e, "failed to schedule propagation after {what}");
        }
    }
}
