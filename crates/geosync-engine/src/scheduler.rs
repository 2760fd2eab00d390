//! Propagation scheduler.
//!
//! Called by the write path after every feature or relation write. It
//! decides which propagation units the write requires and hands them to
//! the task queue. Scheduling never reads or computes property values; the
//! units do that when they run.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use geosync_core::feature::{Feature, FeatureField, WriteScope};
use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId};
use geosync_core::relation::LayerRelation;
use geosync_storage::{diff_properties, RelationStore, SchemaStore, Store};

use crate::error::SyncError;
use crate::queue::TaskQueue;
use crate::registry::FunctionRegistry;
use crate::unit::{PropagationUnit, PropertySelection, Reason, UnitKind};

/// A committed feature write, as seen by the scheduler.
#[derive(Debug, Clone)]
pub struct WrittenFeature {
    pub feature: Feature,
    /// State before the write; `None` for creations or when unknown.
    pub previous: Option<Feature>,
    pub scope: WriteScope,
}

impl WrittenFeature {
    pub fn created(feature: Feature) -> Self {
        WrittenFeature {
            feature,
            previous: None,
            scope: WriteScope::unscoped(),
        }
    }

    pub fn updated(feature: Feature, previous: Feature, scope: WriteScope) -> Self {
        WrittenFeature {
            feature,
            previous: Some(previous),
            scope,
        }
    }

    fn geometry_changed(&self) -> bool {
        self.scope.touches(FeatureField::Geometry)
            && self
                .previous
                .as_ref()
                .map_or(true, |p| p.geometry != self.feature.geometry)
    }

    fn layer_changed(&self) -> bool {
        self.scope.touches(FeatureField::Layer)
            && self
                .previous
                .as_ref()
                .map_or(true, |p| p.layer != self.feature.layer)
    }
}

pub struct PropagationScheduler {
    store: Arc<dyn Store>,
    registry: Arc<FunctionRegistry>,
    queue: Arc<dyn TaskQueue>,
}

impl PropagationScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<FunctionRegistry>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        PropagationScheduler {
            store,
            registry,
            queue,
        }
    }

    /// Schedules the work a committed feature write requires. Returns the
    /// number of units dispatched.
    pub fn on_feature_written(&self, written: &WrittenFeature) -> Result<usize, SyncError> {
        let feature = &written.feature;
        let diff = written
            .previous
            .as_ref()
            .map(|p| diff_properties(&p.properties, &feature.properties));
        let geometry_changed = written.geometry_changed();
        let layer_changed = written.layer_changed();
        let properties_changed = written.scope.touches(FeatureField::Properties)
            && diff.as_ref().map_or(true, |d| !d.is_clean());

        if !(geometry_changed || layer_changed || properties_changed) {
            debug!(feature = %feature.id, "write changed nothing, nothing to schedule");
            return Ok(0);
        }

        let mut units = Vec::new();

        if !written.scope.is_self_recomputation() {
            if let Some(view) = self.store.view_for_layer(feature.layer)? {
                let editable_inputs_changed = properties_changed
                    && diff
                        .as_ref()
                        .map_or(true, |d| d.touches_any_except(|key| view.is_computed_key(key)));
                if view.computed_properties().next().is_some()
                    && (geometry_changed || layer_changed || editable_inputs_changed)
                {
                    units.push(PropagationUnit::recompute(
                        feature.id,
                        Reason::SelfChanged,
                        PropertySelection::All,
                    ));
                }
            }
        }

        let stale_geometry = written
            .previous
            .as_ref()
            .filter(|_| geometry_changed)
            .map(|p| p.geometry.clone());
        units.extend(self.relation_units(feature, stale_geometry)?);

        self.dispatch_all(units)
    }

    /// Schedules propagation for a feature that has just been deleted.
    /// `feature` is its last persisted state.
    pub fn on_feature_deleted(&self, feature: &Feature) -> Result<usize, SyncError> {
        let units = self.relation_units(feature, Some(feature.geometry.clone()))?;
        debug!(feature = %feature.id, units = units.len(), "scheduling propagation for deleted feature");
        self.dispatch_all(units)
    }

    /// Schedules recomputation of relation-dependent properties on every
    /// feature of the relation's layers, and of the layers it connected
    /// before, if `previous` is given.
    pub fn on_relation_changed(
        &self,
        relation: &LayerRelation,
        previous: Option<&LayerRelation>,
    ) -> Result<usize, SyncError> {
        let mut layers = BTreeSet::from([relation.origin, relation.destination]);
        if let Some(previous) = previous {
            layers.extend([previous.origin, previous.destination]);
        }
        info!(relation = %relation.id, name = %relation.name, ?layers, "relation changed, recomputing layers");
        self.schedule_layers(layers, relation)
    }

    /// Like [`PropagationScheduler::on_relation_changed`], for a relation
    /// that no longer exists.
    pub fn on_relation_deleted(&self, relation: &LayerRelation) -> Result<usize, SyncError> {
        let layers = BTreeSet::from([relation.origin, relation.destination]);
        info!(relation = %relation.id, name = %relation.name, "relation deleted, recomputing layers");
        self.schedule_layers(layers, relation)
    }

    /// Schedules full recomputation of `layer` after its view changed.
    pub fn on_view_registered(&self, layer: LayerId) -> Result<usize, SyncError> {
        self.dispatch_all(vec![PropagationUnit::new(UnitKind::RecomputeLayer {
            layer,
            reason: Reason::SchemaChanged,
            selection: PropertySelection::All,
        })])
    }

    /// Schedules one recomputation per feature.
    pub fn fan_out<I>(
        &self,
        features: I,
        reason: &Reason,
        selection: &PropertySelection,
    ) -> Result<usize, SyncError>
    where
        I: IntoIterator<Item = FeatureId>,
    {
        let units = features
            .into_iter()
            .map(|feature| PropagationUnit::recompute(feature, reason.clone(), selection.clone()))
            .collect();
        self.dispatch_all(units)
    }

    /// True if features of `layer` have computed properties that read
    /// related features.
    pub fn layer_reads_relations(&self, layer: LayerId) -> Result<bool, SyncError> {
        Ok(self
            .store
            .view_for_layer(layer)?
            .is_some_and(|view| self.registry.has_relational_properties(&view)))
    }

    pub fn dispatch(&self, unit: PropagationUnit) -> Result<(), SyncError> {
        debug!(unit = %unit, "dispatching");
        self.queue.enqueue(unit)
    }

    fn dispatch_all(&self, units: Vec<PropagationUnit>) -> Result<usize, SyncError> {
        let count = units.len();
        for unit in units {
            self.dispatch(unit)?;
        }
        Ok(count)
    }

    fn relation_units(
        &self,
        feature: &Feature,
        stale_geometry: Option<Geometry>,
    ) -> Result<Vec<PropagationUnit>, SyncError> {
        let mut units = Vec::new();
        for relation in self.store.relations_where_origin(feature.layer)? {
            units.push(PropagationUnit::new(UnitKind::UpdateDestinations {
                origin_feature: feature.id,
                origin_layer: feature.layer,
                relation: relation.id,
                stale_geometry: stale_geometry.clone(),
            }));
        }
        for relation in self.store.relations_where_destination(feature.layer)? {
            units.push(PropagationUnit::new(UnitKind::UpdateOrigins {
                relation: relation.id,
                reason: Reason::RelatedFeatureChanged {
                    relation: relation.id,
                    feature: feature.id,
                },
            }));
        }
        Ok(units)
    }

    fn schedule_layers(
        &self,
        layers: BTreeSet<LayerId>,
        relation: &LayerRelation,
    ) -> Result<usize, SyncError> {
        let units = layers
            .into_iter()
            .map(|layer| {
                PropagationUnit::new(UnitKind::RecomputeLayer {
                    layer,
                    reason: Reason::RelationChanged {
                        relation: relation.id,
                    },
                    selection: PropertySelection::RelationalOnly,
                })
            })
            .collect();
        self.dispatch_all(units)
    }
}
