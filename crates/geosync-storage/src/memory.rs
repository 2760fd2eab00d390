//! In-memory implementation of the storage traits.
//!
//! [`InMemoryStore`] is a first-class backend for tests, ephemeral sessions,
//! and anywhere persistence isn't needed. Features live in a `DashMap`, so
//! the write path and background workers can use it concurrently;
//! compare-and-save holds the per-feature shard lock across the version
//! check and the write.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;

use geosync_core::feature::{Feature, Properties, WriteScope};
use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId, RelationId};
use geosync_core::relation::{LayerRelation, RelationGraph, RelationType};
use geosync_core::schema::CrudView;

use crate::error::StorageError;
use crate::traits::{apply_scoped, FeatureStore, RelationStore, SchemaStore};

/// In-memory implementation of [`FeatureStore`], [`RelationStore`] and
/// [`SchemaStore`].
#[derive(Debug)]
pub struct InMemoryStore {
    features: DashMap<FeatureId, Feature>,
    relations: DashMap<RelationId, LayerRelation>,
    /// Origin/destination index over `relations`.
    relation_graph: RwLock<RelationGraph>,
    layers: DashMap<LayerId, String>,
    views: DashMap<LayerId, CrudView>,
    next_feature_id: AtomicI64,
    next_relation_id: AtomicU32,
    next_layer_id: AtomicU32,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        InMemoryStore {
            features: DashMap::new(),
            relations: DashMap::new(),
            relation_graph: RwLock::new(RelationGraph::new()),
            layers: DashMap::new(),
            views: DashMap::new(),
            next_feature_id: AtomicI64::new(1),
            next_relation_id: AtomicU32::new(1),
            next_layer_id: AtomicU32::new(1),
        }
    }

    fn assert_layer_exists(&self, layer: LayerId) -> Result<(), StorageError> {
        if self.layers.contains_key(&layer) {
            Ok(())
        } else {
            Err(StorageError::LayerNotFound(layer))
        }
    }

    fn rebuild_relation_graph(&self) -> Result<(), StorageError> {
        let mut relations: Vec<LayerRelation> =
            self.relations.iter().map(|r| r.value().clone()).collect();
        relations.sort_by_key(|r| r.id);
        let mut graph = self
            .relation_graph
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        *graph = RelationGraph::from_relations(&relations);
        Ok(())
    }

    fn relations_by_ids(&self, ids: Vec<RelationId>) -> Vec<LayerRelation> {
        ids.into_iter()
            .filter_map(|id| self.relations.get(&id).map(|r| r.value().clone()))
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureStore for InMemoryStore {
    fn insert_feature(
        &self,
        layer: LayerId,
        geometry: Geometry,
        properties: Properties,
    ) -> Result<Feature, StorageError> {
        self.assert_layer_exists(layer)?;
        geometry.validate()?;
        let id = FeatureId(self.next_feature_id.fetch_add(1, Ordering::SeqCst));
        let feature = Feature {
            id,
            layer,
            geometry,
            properties,
            version: 1,
        };
        self.features.insert(id, feature.clone());
        Ok(feature)
    }

    fn get_feature(&self, id: FeatureId) -> Result<Feature, StorageError> {
        self.features
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(StorageError::FeatureNotFound(id))
    }

    fn save_feature(&self, feature: &Feature, scope: &WriteScope) -> Result<Feature, StorageError> {
        feature.geometry.validate()?;
        let mut entry = self
            .features
            .get_mut(&feature.id)
            .ok_or(StorageError::FeatureNotFound(feature.id))?;
        let next = apply_scoped(entry.value(), feature, scope);
        *entry.value_mut() = next.clone();
        Ok(next)
    }

    fn compare_and_save(
        &self,
        feature: &Feature,
        expected_version: u64,
        scope: &WriteScope,
    ) -> Result<Feature, StorageError> {
        feature.geometry.validate()?;
        let mut entry = self
            .features
            .get_mut(&feature.id)
            .ok_or(StorageError::FeatureNotFound(feature.id))?;
        let actual = entry.value().version;
        if actual != expected_version {
            return Err(StorageError::VersionMismatch {
                feature: feature.id,
                expected: expected_version,
                actual,
            });
        }
        let next = apply_scoped(entry.value(), feature, scope);
        *entry.value_mut() = next.clone();
        Ok(next)
    }

    fn delete_feature(&self, id: FeatureId) -> Result<Feature, StorageError> {
        self.features
            .remove(&id)
            .map(|(_, f)| f)
            .ok_or(StorageError::FeatureNotFound(id))
    }

    fn features_in_layer(&self, layer: LayerId) -> Result<Vec<Feature>, StorageError> {
        let mut features: Vec<Feature> = self
            .features
            .iter()
            .filter(|f| f.layer == layer)
            .map(|f| f.value().clone())
            .collect();
        features.sort_by_key(|f| f.id);
        Ok(features)
    }
}

impl RelationStore for InMemoryStore {
    fn create_relation(
        &self,
        name: &str,
        origin: LayerId,
        destination: LayerId,
        relation_type: RelationType,
    ) -> Result<LayerRelation, StorageError> {
        self.assert_layer_exists(origin)?;
        self.assert_layer_exists(destination)?;
        let relation = LayerRelation {
            id: RelationId(self.next_relation_id.fetch_add(1, Ordering::SeqCst)),
            name: name.to_string(),
            origin,
            destination,
            relation_type,
        };
        relation.validate()?;
        self.relations.insert(relation.id, relation.clone());
        self.rebuild_relation_graph()?;
        Ok(relation)
    }

    fn get_relation(&self, id: RelationId) -> Result<LayerRelation, StorageError> {
        self.relations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(StorageError::RelationNotFound(id))
    }

    fn update_relation(&self, relation: &LayerRelation) -> Result<LayerRelation, StorageError> {
        relation.validate()?;
        self.assert_layer_exists(relation.origin)?;
        self.assert_layer_exists(relation.destination)?;
        {
            let mut entry = self
                .relations
                .get_mut(&relation.id)
                .ok_or(StorageError::RelationNotFound(relation.id))?;
            *entry.value_mut() = relation.clone();
        }
        self.rebuild_relation_graph()?;
        Ok(relation.clone())
    }

    fn delete_relation(&self, id: RelationId) -> Result<LayerRelation, StorageError> {
        let (_, relation) = self
            .relations
            .remove(&id)
            .ok_or(StorageError::RelationNotFound(id))?;
        self.relation_graph
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove_relation(id);
        Ok(relation)
    }

    fn list_relations(&self) -> Result<Vec<LayerRelation>, StorageError> {
        let mut relations: Vec<LayerRelation> =
            self.relations.iter().map(|r| r.value().clone()).collect();
        relations.sort_by_key(|r| r.id);
        Ok(relations)
    }

    fn relations_where_origin(&self, layer: LayerId) -> Result<Vec<LayerRelation>, StorageError> {
        let ids = self
            .relation_graph
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .outgoing(layer);
        Ok(self.relations_by_ids(ids))
    }

    fn relations_where_destination(
        &self,
        layer: LayerId,
    ) -> Result<Vec<LayerRelation>, StorageError> {
        let ids = self
            .relation_graph
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .incoming(layer);
        Ok(self.relations_by_ids(ids))
    }
}

impl SchemaStore for InMemoryStore {
    fn create_layer(&self, name: &str) -> Result<LayerId, StorageError> {
        let id = LayerId(self.next_layer_id.fetch_add(1, Ordering::SeqCst));
        self.layers.insert(id, name.to_string());
        Ok(id)
    }

    fn list_layers(&self) -> Result<Vec<(LayerId, String)>, StorageError> {
        let mut layers: Vec<(LayerId, String)> = self
            .layers
            .iter()
            .map(|l| (*l.key(), l.value().clone()))
            .collect();
        layers.sort_by_key(|(id, _)| *id);
        Ok(layers)
    }

    fn register_view(&self, view: &CrudView) -> Result<(), StorageError> {
        self.assert_layer_exists(view.layer)?;
        view.validate()?;
        self.views.insert(view.layer, view.clone());
        Ok(())
    }

    fn view_for_layer(&self, layer: LayerId) -> Result<Option<CrudView>, StorageError> {
        Ok(self.views.get(&layer).map(|v| v.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosync_core::feature::FeatureField;
    use geosync_core::id::ViewId;
    use geosync_core::schema::CrudViewProperty;
    use serde_json::json;

    fn store_with_layers() -> (InMemoryStore, LayerId, LayerId) {
        let store = InMemoryStore::new();
        let lines = store.create_layer("lines").unwrap();
        let cities = store.create_layer("cities").unwrap();
        (store, lines, cities)
    }

    #[test]
    fn insert_and_get() {
        let (store, lines, _) = store_with_layers();
        let f = store
            .insert_feature(lines, Geometry::line([(0.0, 0.0), (1.0, 0.0)]), Properties::new())
            .unwrap();
        assert_eq!(f.version, 1);
        assert_eq!(store.get_feature(f.id).unwrap(), f);
    }

    #[test]
    fn insert_into_unknown_layer_fails() {
        let store = InMemoryStore::new();
        let err = store
            .insert_feature(LayerId(9), Geometry::point(0.0, 0.0), Properties::new())
            .unwrap_err();
        assert!(matches!(err, StorageError::LayerNotFound(LayerId(9))));
    }

    #[test]
    fn scoped_save_only_persists_scoped_fields() {
        let (store, lines, _) = store_with_layers();
        let f = store
            .insert_feature(
                lines,
                Geometry::line([(0.0, 0.0), (1.0, 0.0)]),
                Properties::new().with("name", json!("a")),
            )
            .unwrap();

        let edited = f
            .with_geometry(Geometry::line([(0.0, 0.0), (5.0, 0.0)]))
            .with_properties(Properties::new().with("name", json!("b")));
        let saved = store
            .save_feature(&edited, &WriteScope::fields([FeatureField::Properties]))
            .unwrap();

        assert_eq!(saved.version, 2);
        assert_eq!(saved.properties.get("name"), Some(&json!("b")));
        assert_eq!(saved.geometry, f.geometry);
    }

    #[test]
    fn compare_and_save_rejects_stale_version() {
        let (store, lines, _) = store_with_layers();
        let f = store
            .insert_feature(lines, Geometry::point(0.0, 0.0), Properties::new())
            .unwrap();
        store.save_feature(&f, &WriteScope::unscoped()).unwrap();

        let err = store
            .compare_and_save(&f, f.version, &WriteScope::unscoped())
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionMismatch { expected: 1, actual: 2, .. }
        ));
    }

    #[test]
    fn deleted_feature_is_not_found() {
        let (store, lines, _) = store_with_layers();
        let f = store
            .insert_feature(lines, Geometry::point(0.0, 0.0), Properties::new())
            .unwrap();
        store.delete_feature(f.id).unwrap();
        assert!(store.get_feature(f.id).unwrap_err().is_not_found());
        assert_eq!(store.find_feature(f.id).unwrap(), None);
        assert!(store.save_feature(&f, &WriteScope::unscoped()).is_err());
    }

    #[test]
    fn relation_index_follows_mutations() {
        let (store, lines, cities) = store_with_layers();
        let rel = store
            .create_relation("cities", lines, cities, RelationType::Intersects)
            .unwrap();
        assert_eq!(store.relations_where_origin(lines).unwrap(), vec![rel.clone()]);
        assert_eq!(store.relations_where_destination(cities).unwrap(), vec![rel.clone()]);
        assert!(store.relations_where_origin(cities).unwrap().is_empty());

        let mut flipped = rel.clone();
        flipped.origin = cities;
        flipped.destination = lines;
        store.update_relation(&flipped).unwrap();
        assert_eq!(store.relations_where_origin(cities).unwrap(), vec![flipped]);

        store.delete_relation(rel.id).unwrap();
        assert!(store.relations_where_origin(cities).unwrap().is_empty());
        assert!(matches!(
            store.get_relation(rel.id),
            Err(StorageError::RelationNotFound(_))
        ));
    }

    #[test]
    fn resolve_related_in_both_directions() {
        let (store, lines, cities) = store_with_layers();
        let rel = store
            .create_relation("cities", lines, cities, RelationType::Intersects)
            .unwrap();
        let line = store
            .insert_feature(lines, Geometry::line([(0.0, 0.0), (1.0, 0.0)]), Properties::new())
            .unwrap();
        let town = store
            .insert_feature(cities, Geometry::rect((0.0, 0.0), (1.0, 1.0)), Properties::new())
            .unwrap();
        store
            .insert_feature(cities, Geometry::rect((5.0, 5.0), (6.0, 6.0)), Properties::new())
            .unwrap();

        let from_line = store.resolve_related(&line, &rel).unwrap();
        assert_eq!(from_line.iter().map(|f| f.id).collect::<Vec<_>>(), vec![town.id]);

        let from_town = store.resolve_related(&town, &rel).unwrap();
        assert_eq!(from_town.iter().map(|f| f.id).collect::<Vec<_>>(), vec![line.id]);
    }

    #[test]
    fn self_relation_excludes_subject() {
        let (store, lines, _) = store_with_layers();
        let rel = store
            .create_relation("crossing", lines, lines, RelationType::Intersects)
            .unwrap();
        let a = store
            .insert_feature(lines, Geometry::line([(0.0, 0.0), (2.0, 0.0)]), Properties::new())
            .unwrap();
        let b = store
            .insert_feature(lines, Geometry::line([(1.0, -1.0), (1.0, 1.0)]), Properties::new())
            .unwrap();
        let related = store.resolve_related(&a, &rel).unwrap();
        assert_eq!(related.iter().map(|f| f.id).collect::<Vec<_>>(), vec![b.id]);
    }

    #[test]
    fn one_view_per_layer() {
        let (store, lines, _) = store_with_layers();
        let mut view = CrudView {
            id: ViewId(1),
            name: "Lines".into(),
            layer: lines,
            properties: vec![CrudViewProperty::computed("length", "length", None)],
        };
        store.register_view(&view).unwrap();
        view.name = "Roads".into();
        store.register_view(&view).unwrap();

        let stored = store.view_for_layer(lines).unwrap().unwrap();
        assert_eq!(stored.name, "Roads");
        assert_eq!(store.computed_properties(lines).unwrap().len(), 1);
    }
}
