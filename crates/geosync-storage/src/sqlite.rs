//! SQLite implementation of the storage traits.
//!
//! [`SqliteStore`] persists layers, views, features and relations in a
//! SQLite database with WAL mode and automatic schema migrations. Geometry,
//! properties bags, view declarations and relation types are stored as JSON
//! TEXT columns via serde_json. The connection sits behind a mutex so the
//! store can be shared with background workers; every write runs in its own
//! transaction.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use geosync_core::feature::{Feature, Properties, WriteScope};
use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId, RelationId, ViewId};
use geosync_core::relation::{LayerRelation, RelationType};
use geosync_core::schema::{CrudView, CrudViewProperty};

use crate::error::StorageError;
use crate::traits::{apply_scoped, FeatureStore, RelationStore, SchemaStore};

/// A feature row before JSON decoding.
type FeatureRow = (i64, u32, String, String, i64);

/// A relation row before JSON decoding.
type RelationRow = (u32, String, u32, u32, String);

const FEATURE_COLUMNS: &str = "id, layer_id, geometry_json, properties_json, version";
const RELATION_COLUMNS: &str = "id, name, origin_id, destination_id, relation_type_json";

/// SQLite-backed implementation of the storage traits.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn read_feature_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeatureRow> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode_feature(
        (id, layer, geometry, properties, version): FeatureRow,
    ) -> Result<Feature, StorageError> {
        Ok(Feature {
            id: FeatureId(id),
            layer: LayerId(layer),
            geometry: serde_json::from_str(&geometry)?,
            properties: serde_json::from_str(&properties)?,
            version: version as u64,
        })
    }

    fn read_relation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationRow> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode_relation(
        (id, name, origin, destination, relation_type): RelationRow,
    ) -> Result<LayerRelation, StorageError> {
        Ok(LayerRelation {
            id: RelationId(id),
            name,
            origin: LayerId(origin),
            destination: LayerId(destination),
            relation_type: serde_json::from_str(&relation_type)?,
        })
    }

    fn fetch_feature(conn: &Connection, id: FeatureId) -> Result<Feature, StorageError> {
        let row = conn
            .query_row(
                &format!("SELECT {FEATURE_COLUMNS} FROM features WHERE id = ?1"),
                params![id.0],
                Self::read_feature_row,
            )
            .optional()?
            .ok_or(StorageError::FeatureNotFound(id))?;
        Self::decode_feature(row)
    }

    fn assert_layer_exists(conn: &Connection, layer: LayerId) -> Result<(), StorageError> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM layers WHERE id = ?1)",
            params![layer.0],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StorageError::LayerNotFound(layer));
        }
        Ok(())
    }

    /// Writes `next` over the stored row. Caller holds the transaction.
    fn write_feature(conn: &Connection, next: &Feature) -> Result<(), StorageError> {
        conn.execute(
            "UPDATE features SET layer_id = ?2, geometry_json = ?3, properties_json = ?4, version = ?5 WHERE id = ?1",
            params![
                next.id.0,
                next.layer.0,
                serde_json::to_string(&next.geometry)?,
                serde_json::to_string(&next.properties)?,
                next.version as i64,
            ],
        )?;
        Ok(())
    }

    fn query_relations(
        conn: &Connection,
        filter: &str,
        layer: Option<LayerId>,
    ) -> Result<Vec<LayerRelation>, StorageError> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations {filter} ORDER BY id"
        ))?;
        let rows = match layer {
            Some(layer) => stmt
                .query_map(params![layer.0], Self::read_relation_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], Self::read_relation_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        rows.into_iter().map(Self::decode_relation).collect()
    }
}

impl FeatureStore for SqliteStore {
    fn insert_feature(
        &self,
        layer: LayerId,
        geometry: Geometry,
        properties: Properties,
    ) -> Result<Feature, StorageError> {
        geometry.validate()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::assert_layer_exists(&tx, layer)?;
        tx.execute(
            "INSERT INTO features (layer_id, geometry_json, properties_json, version) VALUES (?1, ?2, ?3, 1)",
            params![
                layer.0,
                serde_json::to_string(&geometry)?,
                serde_json::to_string(&properties)?,
            ],
        )?;
        let id = FeatureId(tx.last_insert_rowid());
        tx.commit()?;
        Ok(Feature {
            id,
            layer,
            geometry,
            properties,
            version: 1,
        })
    }

    fn get_feature(&self, id: FeatureId) -> Result<Feature, StorageError> {
        let conn = self.conn()?;
        Self::fetch_feature(&conn, id)
    }

    fn save_feature(&self, feature: &Feature, scope: &WriteScope) -> Result<Feature, StorageError> {
        feature.geometry.validate()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored = Self::fetch_feature(&tx, feature.id)?;
        let next = apply_scoped(&stored, feature, scope);
        Self::write_feature(&tx, &next)?;
        tx.commit()?;
        Ok(next)
    }

    fn compare_and_save(
        &self,
        feature: &Feature,
        expected_version: u64,
        scope: &WriteScope,
    ) -> Result<Feature, StorageError> {
        feature.geometry.validate()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored = Self::fetch_feature(&tx, feature.id)?;
        if stored.version != expected_version {
            return Err(StorageError::VersionMismatch {
                feature: feature.id,
                expected: expected_version,
                actual: stored.version,
            });
        }
        let next = apply_scoped(&stored, feature, scope);
        Self::write_feature(&tx, &next)?;
        tx.commit()?;
        Ok(next)
    }

    fn delete_feature(&self, id: FeatureId) -> Result<Feature, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored = Self::fetch_feature(&tx, id)?;
        tx.execute("DELETE FROM features WHERE id = ?1", params![id.0])?;
        tx.commit()?;
        Ok(stored)
    }

    fn features_in_layer(&self, layer: LayerId) -> Result<Vec<Feature>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FEATURE_COLUMNS} FROM features WHERE layer_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![layer.0], Self::read_feature_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode_feature).collect()
    }
}

impl RelationStore for SqliteStore {
    fn create_relation(
        &self,
        name: &str,
        origin: LayerId,
        destination: LayerId,
        relation_type: RelationType,
    ) -> Result<LayerRelation, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::assert_layer_exists(&tx, origin)?;
        Self::assert_layer_exists(&tx, destination)?;
        tx.execute(
            "INSERT INTO relations (name, origin_id, destination_id, relation_type_json) VALUES (?1, ?2, ?3, ?4)",
            params![name, origin.0, destination.0, serde_json::to_string(&relation_type)?],
        )?;
        let relation = LayerRelation {
            id: RelationId(tx.last_insert_rowid() as u32),
            name: name.to_string(),
            origin,
            destination,
            relation_type,
        };
        // Validate before commit so a rejected definition leaves no row.
        relation.validate()?;
        tx.commit()?;
        Ok(relation)
    }

    fn get_relation(&self, id: RelationId) -> Result<LayerRelation, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {RELATION_COLUMNS} FROM relations WHERE id = ?1"),
                params![id.0],
                Self::read_relation_row,
            )
            .optional()?
            .ok_or(StorageError::RelationNotFound(id))?;
        Self::decode_relation(row)
    }

    fn update_relation(&self, relation: &LayerRelation) -> Result<LayerRelation, StorageError> {
        relation.validate()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::assert_layer_exists(&tx, relation.origin)?;
        Self::assert_layer_exists(&tx, relation.destination)?;
        let changed = tx.execute(
            "UPDATE relations SET name = ?2, origin_id = ?3, destination_id = ?4, relation_type_json = ?5 WHERE id = ?1",
            params![
                relation.id.0,
                relation.name,
                relation.origin.0,
                relation.destination.0,
                serde_json::to_string(&relation.relation_type)?,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::RelationNotFound(relation.id));
        }
        tx.commit()?;
        Ok(relation.clone())
    }

    fn delete_relation(&self, id: RelationId) -> Result<LayerRelation, StorageError> {
        let existing = self.get_relation(id)?;
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM relations WHERE id = ?1", params![id.0])?;
        if changed == 0 {
            return Err(StorageError::RelationNotFound(id));
        }
        Ok(existing)
    }

    fn list_relations(&self) -> Result<Vec<LayerRelation>, StorageError> {
        let conn = self.conn()?;
        Self::query_relations(&conn, "", None)
    }

    fn relations_where_origin(&self, layer: LayerId) -> Result<Vec<LayerRelation>, StorageError> {
        let conn = self.conn()?;
        Self::query_relations(&conn, "WHERE origin_id = ?1", Some(layer))
    }

    fn relations_where_destination(
        &self,
        layer: LayerId,
    ) -> Result<Vec<LayerRelation>, StorageError> {
        let conn = self.conn()?;
        Self::query_relations(&conn, "WHERE destination_id = ?1", Some(layer))
    }
}

impl SchemaStore for SqliteStore {
    fn create_layer(&self, name: &str) -> Result<LayerId, StorageError> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO layers (name) VALUES (?1)", params![name])?;
        Ok(LayerId(conn.last_insert_rowid() as u32))
    }

    fn list_layers(&self) -> Result<Vec<(LayerId, String)>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT id, name FROM layers ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let id: u32 = row.get(0)?;
            let name: String = row.get(1)?;
            Ok((LayerId(id), name))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn register_view(&self, view: &CrudView) -> Result<(), StorageError> {
        view.validate()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::assert_layer_exists(&tx, view.layer)?;
        tx.execute(
            "INSERT INTO views (layer_id, view_id, name, properties_json) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(layer_id) DO UPDATE SET view_id = excluded.view_id, name = excluded.name, properties_json = excluded.properties_json",
            params![
                view.layer.0,
                view.id.0,
                view.name,
                serde_json::to_string(&view.properties)?,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn view_for_layer(&self, layer: LayerId) -> Result<Option<CrudView>, StorageError> {
        let conn = self.conn()?;
        let row: Option<(u32, String, String)> = conn
            .query_row(
                "SELECT view_id, name, properties_json FROM views WHERE layer_id = ?1",
                params![layer.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some((view_id, name, properties_json)) => {
                let properties: Vec<CrudViewProperty> = serde_json::from_str(&properties_json)?;
                Ok(Some(CrudView {
                    id: ViewId(view_id),
                    name,
                    layer,
                    properties,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosync_core::feature::FeatureField;
    use serde_json::json;

    fn store_with_layers() -> (SqliteStore, LayerId, LayerId) {
        let store = SqliteStore::in_memory().unwrap();
        let lines = store.create_layer("lines").unwrap();
        let cities = store.create_layer("cities").unwrap();
        (store, lines, cities)
    }

    #[test]
    fn feature_roundtrip_preserves_geometry_and_properties() {
        let (store, lines, _) = store_with_layers();
        let props = Properties::new()
            .with("name", json!("road"))
            .with("tags", json!(["a", "b"]));
        let f = store
            .insert_feature(lines, Geometry::line([(0.0, 0.0), (1.0, 0.0)]), props)
            .unwrap();
        let loaded = store.get_feature(f.id).unwrap();
        assert_eq!(loaded, f);
    }

    #[test]
    fn scoped_save_and_version_bump() {
        let (store, lines, _) = store_with_layers();
        let f = store
            .insert_feature(lines, Geometry::point(0.0, 0.0), Properties::new())
            .unwrap();
        let moved = f
            .with_geometry(Geometry::point(3.0, 3.0))
            .with_properties(Properties::new().with("ignored", json!(true)));
        let saved = store
            .save_feature(&moved, &WriteScope::fields([FeatureField::Geometry]))
            .unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(saved.geometry, Geometry::point(3.0, 3.0));
        assert!(saved.properties.is_empty());
        assert_eq!(store.get_feature(f.id).unwrap(), saved);
    }

    #[test]
    fn compare_and_save_detects_interleaved_write() {
        let (store, lines, _) = store_with_layers();
        let f = store
            .insert_feature(lines, Geometry::point(0.0, 0.0), Properties::new())
            .unwrap();
        store.save_feature(&f, &WriteScope::unscoped()).unwrap();
        assert!(matches!(
            store.compare_and_save(&f, 1, &WriteScope::unscoped()),
            Err(StorageError::VersionMismatch { actual: 2, .. })
        ));
        assert!(store.compare_and_save(&f, 2, &WriteScope::unscoped()).is_ok());
    }

    #[test]
    fn relations_crud_and_lookup() {
        let (store, lines, cities) = store_with_layers();
        let rel = store
            .create_relation("near", lines, cities, RelationType::Distance { distance: 2.0 })
            .unwrap();
        assert_eq!(store.get_relation(rel.id).unwrap(), rel);
        assert_eq!(store.relations_where_origin(lines).unwrap(), vec![rel.clone()]);
        assert_eq!(store.relations_where_destination(cities).unwrap(), vec![rel.clone()]);
        assert_eq!(store.find_relation_by_name("near").unwrap(), Some(rel.clone()));

        let mut widened = rel.clone();
        widened.relation_type = RelationType::Distance { distance: 10.0 };
        store.update_relation(&widened).unwrap();
        assert_eq!(store.get_relation(rel.id).unwrap(), widened);

        store.delete_relation(rel.id).unwrap();
        assert!(store.list_relations().unwrap().is_empty());
        assert!(matches!(
            store.delete_relation(rel.id),
            Err(StorageError::RelationNotFound(_))
        ));
    }

    #[test]
    fn invalid_relation_is_not_persisted() {
        let (store, lines, cities) = store_with_layers();
        let err = store
            .create_relation("bad", lines, cities, RelationType::Distance { distance: -1.0 })
            .unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        assert!(store.list_relations().unwrap().is_empty());
    }

    #[test]
    fn view_upsert_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.db");
        let path = path.to_str().unwrap();
        let layer;
        {
            let store = SqliteStore::new(path).unwrap();
            layer = store.create_layer("lines").unwrap();
            let view = CrudView {
                id: ViewId(4),
                name: "Lines".into(),
                layer,
                properties: vec![CrudViewProperty::computed("length", "length", None)],
            };
            store.register_view(&view).unwrap();
        }
        let reopened = SqliteStore::new(path).unwrap();
        let view = reopened.view_for_layer(layer).unwrap().unwrap();
        assert_eq!(view.id, ViewId(4));
        assert_eq!(reopened.computed_properties(layer).unwrap().len(), 1);
    }
}
