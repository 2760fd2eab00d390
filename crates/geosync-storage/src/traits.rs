//! The storage contracts the synchronization engine consumes.
//!
//! Three collaborator traits, one per concern:
//! - [`FeatureStore`]: feature CRUD, including the compare-and-save
//!   primitive the concurrency guard relies on.
//! - [`RelationStore`]: layer relations and spatial resolution of related
//!   features.
//! - [`SchemaStore`]: layers and their CRUD view declarations.
//!
//! All methods take `&self`: backends are shared between the write path and
//! background workers, so they synchronize internally. [`Store`] bundles the
//! three for callers that need all of them.

use geosync_core::feature::{Feature, FeatureField, Properties, WriteScope};
use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId, RelationId};
use geosync_core::relation::{LayerRelation, RelationType};
use geosync_core::schema::{CrudView, CrudViewProperty};

use crate::error::StorageError;

/// Persistence of features.
pub trait FeatureStore {
    /// Inserts a new feature at version 1 and returns it with its ID.
    fn insert_feature(
        &self,
        layer: LayerId,
        geometry: Geometry,
        properties: Properties,
    ) -> Result<Feature, StorageError>;

    /// Retrieves a feature by ID, or [`StorageError::FeatureNotFound`].
    fn get_feature(&self, id: FeatureId) -> Result<Feature, StorageError>;

    /// Unconditionally persists the fields of `feature` covered by `scope`
    /// onto the stored row, bumping its version. Fields outside the scope
    /// keep their stored value.
    fn save_feature(&self, feature: &Feature, scope: &WriteScope) -> Result<Feature, StorageError>;

    /// Like [`FeatureStore::save_feature`], but only if the stored version
    /// still equals `expected_version`; otherwise fails with
    /// [`StorageError::VersionMismatch`].
    fn compare_and_save(
        &self,
        feature: &Feature,
        expected_version: u64,
        scope: &WriteScope,
    ) -> Result<Feature, StorageError>;

    /// Deletes a feature, returning its last persisted state.
    fn delete_feature(&self, id: FeatureId) -> Result<Feature, StorageError>;

    /// All features of a layer, sorted by ID.
    fn features_in_layer(&self, layer: LayerId) -> Result<Vec<Feature>, StorageError>;

    /// Convenience: `Ok(None)` instead of `FeatureNotFound`.
    fn find_feature(&self, id: FeatureId) -> Result<Option<Feature>, StorageError> {
        match self.get_feature(id) {
            Ok(feature) => Ok(Some(feature)),
            Err(StorageError::FeatureNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Persistence and spatial evaluation of layer relations.
pub trait RelationStore: FeatureStore {
    fn create_relation(
        &self,
        name: &str,
        origin: LayerId,
        destination: LayerId,
        relation_type: RelationType,
    ) -> Result<LayerRelation, StorageError>;

    /// Retrieves a relation by ID, or [`StorageError::RelationNotFound`].
    fn get_relation(&self, id: RelationId) -> Result<LayerRelation, StorageError>;

    /// Replaces the stored definition (name, endpoints, type) of a relation.
    fn update_relation(&self, relation: &LayerRelation) -> Result<LayerRelation, StorageError>;

    /// Deletes a relation, returning its last definition.
    fn delete_relation(&self, id: RelationId) -> Result<LayerRelation, StorageError>;

    /// All relations, sorted by ID.
    fn list_relations(&self) -> Result<Vec<LayerRelation>, StorageError>;

    /// Relations whose origin layer is `layer`.
    fn relations_where_origin(&self, layer: LayerId) -> Result<Vec<LayerRelation>, StorageError> {
        Ok(self
            .list_relations()?
            .into_iter()
            .filter(|r| r.origin == layer)
            .collect())
    }

    /// Relations whose destination layer is `layer`.
    fn relations_where_destination(
        &self,
        layer: LayerId,
    ) -> Result<Vec<LayerRelation>, StorageError> {
        Ok(self
            .list_relations()?
            .into_iter()
            .filter(|r| r.destination == layer)
            .collect())
    }

    /// Looks a relation up by name.
    fn find_relation_by_name(&self, name: &str) -> Result<Option<LayerRelation>, StorageError> {
        Ok(self.list_relations()?.into_iter().find(|r| r.name == name))
    }

    /// Features on the far side of `relation` matching `geometry`, as seen
    /// from a feature of `layer`. Sorted by ID.
    fn resolve_related_geometry(
        &self,
        layer: LayerId,
        geometry: &Geometry,
        relation: &LayerRelation,
    ) -> Result<Vec<Feature>, StorageError> {
        let other = relation
            .other_end(layer)
            .ok_or_else(|| StorageError::IntegrityError {
                reason: format!(
                    "layer {layer} is not an endpoint of relation {} ({})",
                    relation.id, relation.name
                ),
            })?;
        Ok(self
            .features_in_layer(other)?
            .into_iter()
            .filter(|candidate| relation.relation_type.matches(geometry, &candidate.geometry))
            .collect())
    }

    /// Features related to `feature` across `relation`. A feature is never
    /// related to itself, even through a self-relation.
    fn resolve_related(
        &self,
        feature: &Feature,
        relation: &LayerRelation,
    ) -> Result<Vec<Feature>, StorageError> {
        let mut related =
            self.resolve_related_geometry(feature.layer, &feature.geometry, relation)?;
        related.retain(|f| f.id != feature.id);
        Ok(related)
    }
}

/// Persistence of layers and their view schemas.
pub trait SchemaStore {
    /// Creates a layer and returns its ID.
    fn create_layer(&self, name: &str) -> Result<LayerId, StorageError>;

    /// All layers as `(id, name)`, sorted by ID.
    fn list_layers(&self) -> Result<Vec<(LayerId, String)>, StorageError>;

    /// Registers (or replaces) the view of `view.layer`. One view per layer.
    fn register_view(&self, view: &CrudView) -> Result<(), StorageError>;

    /// The view configured over `layer`, if any.
    fn view_for_layer(&self, layer: LayerId) -> Result<Option<CrudView>, StorageError>;

    /// The computed properties declared by the view of `layer`.
    fn computed_properties(&self, layer: LayerId) -> Result<Vec<CrudViewProperty>, StorageError> {
        Ok(self
            .view_for_layer(layer)?
            .map(|view| view.computed_properties().cloned().collect())
            .unwrap_or_default())
    }
}

/// Everything the engine needs from a backend, shareable across threads.
pub trait Store: FeatureStore + RelationStore + SchemaStore + Send + Sync {}

impl<T> Store for T where T: FeatureStore + RelationStore + SchemaStore + Send + Sync {}

/// Builds the row a scoped save persists: `incoming` values for the fields
/// in `scope`, `stored` values for everything else, version bumped.
pub(crate) fn apply_scoped(stored: &Feature, incoming: &Feature, scope: &WriteScope) -> Feature {
    Feature {
        id: stored.id,
        layer: if scope.touches(FeatureField::Layer) {
            incoming.layer
        } else {
            stored.layer
        },
        geometry: if scope.touches(FeatureField::Geometry) {
            incoming.geometry.clone()
        } else {
            stored.geometry.clone()
        },
        properties: if scope.touches(FeatureField::Properties) {
            incoming.properties.clone()
        } else {
            stored.properties.clone()
        },
        version: stored.version + 1,
    }
}
