//! Executes propagation units against the store.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use geosync_core::feature::WriteScope;
use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId, RelationId};
use geosync_core::relation::LayerRelation;
use geosync_storage::{FeatureStore, RelationStore, StorageError, Store};

use crate::compute::{ComputationEngine, Outcome};
use crate::error::SyncError;
use crate::queue::UnitHandler;
use crate::scheduler::{PropagationScheduler, WrittenFeature};
use crate::unit::{PropagationUnit, PropertySelection, Reason, UnitKind};

/// How a unit ended. Stale targets are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "subject", rename_all = "snake_case")]
pub enum UnitOutcome {
    Recomputed(FeatureId),
    Unchanged(FeatureId),
    /// Target feature deleted before or during execution.
    Gone(FeatureId),
    /// The unit's relation was deleted or no longer touches the layer.
    RelationNotFound(RelationId),
    /// Dispatched this many follow-up units.
    FannedOut(usize),
}

pub struct UnitRunner {
    store: Arc<dyn Store>,
    engine: Arc<ComputationEngine>,
    scheduler: Arc<PropagationScheduler>,
}

impl UnitRunner {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<ComputationEngine>,
        scheduler: Arc<PropagationScheduler>,
    ) -> Self {
        UnitRunner {
            store,
            engine,
            scheduler,
        }
    }

    fn recompute(
        &self,
        feature: FeatureId,
        selection: &PropertySelection,
    ) -> Result<UnitOutcome, SyncError> {
        match self.engine.recompute(feature, selection)? {
            Outcome::Success { feature: saved, previous } => {
                let id = saved.id;
                self.scheduler.on_feature_written(&WrittenFeature::updated(
                    saved,
                    previous,
                    WriteScope::engine(),
                ))?;
                Ok(UnitOutcome::Recomputed(id))
            }
            Outcome::Unchanged => Ok(UnitOutcome::Unchanged(feature)),
            Outcome::Gone => Ok(UnitOutcome::Gone(feature)),
        }
    }

    /// `None` if the relation is gone.
    fn live_relation(&self, id: RelationId) -> Result<Option<LayerRelation>, SyncError> {
        match self.store.get_relation(id) {
            Ok(relation) => Ok(Some(relation)),
            Err(StorageError::RelationNotFound(_)) => {
                debug!(relation = %id, "relation deleted before unit ran");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_destinations(
        &self,
        origin_feature: FeatureId,
        origin_layer: LayerId,
        relation_id: RelationId,
        stale_geometry: Option<&Geometry>,
    ) -> Result<UnitOutcome, SyncError> {
        let Some(relation) = self.live_relation(relation_id)? else {
            return Ok(UnitOutcome::RelationNotFound(relation_id));
        };
        let Some(target_layer) = relation.other_end(origin_layer) else {
            debug!(relation = %relation_id, layer = %origin_layer, "relation no longer touches layer");
            return Ok(UnitOutcome::RelationNotFound(relation_id));
        };
        if !self.scheduler.layer_reads_relations(target_layer)? {
            return Ok(UnitOutcome::FannedOut(0));
        }

        let mut geometries = Vec::new();
        if let Some(current) = self.store.find_feature(origin_feature)? {
            if current.layer == origin_layer {
                geometries.push(current.geometry);
            }
        }
        geometries.extend(stale_geometry.cloned());

        let mut targets = BTreeSet::new();
        for geometry in &geometries {
            for related in self.store.resolve_related_geometry(origin_layer, geometry, &relation)? {
                if related.id != origin_feature {
                    targets.insert(related.id);
                }
            }
        }
        let reason = Reason::RelatedFeatureChanged {
            relation: relation_id,
            feature: origin_feature,
        };
        let n = self
            .scheduler
            .fan_out(targets, &reason, &PropertySelection::RelationalOnly)?;
        Ok(UnitOutcome::FannedOut(n))
    }

    fn update_origins(
        &self,
        relation_id: RelationId,
        reason: &Reason,
    ) -> Result<UnitOutcome, SyncError> {
        let Some(relation) = self.live_relation(relation_id)? else {
            return Ok(UnitOutcome::RelationNotFound(relation_id));
        };
        self.recompute_layer(relation.origin, reason, &PropertySelection::RelationalOnly)
    }

    fn recompute_layer(
        &self,
        layer: LayerId,
        reason: &Reason,
        selection: &PropertySelection,
    ) -> Result<UnitOutcome, SyncError> {
        if *selection == PropertySelection::RelationalOnly
            && !self.scheduler.layer_reads_relations(layer)?
        {
            return Ok(UnitOutcome::FannedOut(0));
        }
        let features = match self.store.features_in_layer(layer) {
            Ok(features) => features,
            Err(StorageError::LayerNotFound(_)) => return Ok(UnitOutcome::FannedOut(0)),
            Err(e) => return Err(e.into()),
        };
        let n = self
            .scheduler
            .fan_out(features.into_iter().map(|f| f.id), reason, selection)?;
        Ok(UnitOutcome::FannedOut(n))
    }
}

impl UnitHandler for UnitRunner {
    fn handle(&self, unit: &PropagationUnit) -> Result<UnitOutcome, SyncError> {
        match &unit.kind {
            UnitKind::Recompute {
                feature, selection, ..
            } => self.recompute(*feature, selection),
            UnitKind::UpdateDestinations {
                origin_feature,
                origin_layer,
                relation,
                stale_geometry,
            } => self.update_destinations(
                *origin_feature,
                *origin_layer,
                *relation,
                stale_geometry.as_ref(),
            ),
            UnitKind::UpdateOrigins { relation, reason } => self.update_origins(*relation, reason),
            UnitKind::RecomputeLayer {
                layer,
                reason,
                selection,
            } => self.recompute_layer(*layer, reason, selection),
        }
    }
}
