//! JSON fixtures for `geosync load`.
//!
//! Layers are referenced by name; a layer that already exists in the
//! database is reused.
//!
//! ```json
//! {
//!   "layers": ["Lines", "Cities"],
//!   "views": [{"layer": "Lines", "name": "Lines", "properties": [
//!     {"key": "length", "editable": false, "function_path": "length"}
//!   ]}],
//!   "relations": [{"name": "crosses", "origin": "Lines", "destination": "Cities",
//!                  "relation_type": {"type": "intersects"}}],
//!   "features": [{"layer": "Lines",
//!                 "geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 0]]}}]
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use geosync_core::feature::Properties;
use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId, RelationId, ViewId};
use geosync_core::relation::RelationType;
use geosync_core::schema::{CrudView, CrudViewProperty};
use geosync_engine::GeoService;
use geosync_storage::SchemaStore;

use crate::CliError;

#[derive(Debug, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub views: Vec<ViewFixture>,
    #[serde(default)]
    pub relations: Vec<RelationFixture>,
    #[serde(default)]
    pub features: Vec<FeatureFixture>,
}

#[derive(Debug, Deserialize)]
pub struct ViewFixture {
    pub layer: String,
    pub name: String,
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub properties: Vec<CrudViewProperty>,
}

#[derive(Debug, Deserialize)]
pub struct RelationFixture {
    pub name: String,
    pub origin: String,
    pub destination: String,
    pub relation_type: RelationType,
}

#[derive(Debug, Deserialize)]
pub struct FeatureFixture {
    pub layer: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Properties,
}

/// What a load created.
#[derive(Debug, Default, Serialize)]
pub struct LoadSummary {
    pub layers: BTreeMap<String, LayerId>,
    pub views: Vec<ViewId>,
    pub relations: Vec<RelationId>,
    pub features: Vec<FeatureId>,
}

impl Fixture {
    pub fn parse(text: &str) -> Result<Self, CliError> {
        serde_json::from_str(text).map_err(|e| CliError::Fixture(e.to_string()))
    }

    /// Creates everything through `service`, so computed properties are
    /// derived as features arrive.
    pub fn load(&self, service: &GeoService) -> Result<LoadSummary, CliError> {
        let mut summary = LoadSummary {
            layers: service
                .store()
                .list_layers()?
                .into_iter()
                .map(|(id, name)| (name, id))
                .collect(),
            ..LoadSummary::default()
        };

        for name in &self.layers {
            if !summary.layers.contains_key(name) {
                let id = service.create_layer(name)?;
                summary.layers.insert(name.clone(), id);
            }
        }
        let layer = |name: &str| {
            summary
                .layers
                .get(name)
                .copied()
                .ok_or_else(|| CliError::Fixture(format!("unknown layer '{name}'")))
        };

        let mut views = Vec::new();
        for (index, view) in self.views.iter().enumerate() {
            let id = ViewId(view.id.unwrap_or(index as u32 + 1));
            service.register_view(&CrudView {
                id,
                name: view.name.clone(),
                layer: layer(&view.layer)?,
                properties: view.properties.clone(),
            })?;
            views.push(id);
        }

        let mut relations = Vec::new();
        for relation in &self.relations {
            let created = service.create_relation(
                &relation.name,
                layer(&relation.origin)?,
                layer(&relation.destination)?,
                relation.relation_type,
            )?;
            relations.push(created.id);
        }

        let mut features = Vec::new();
        for feature in &self.features {
            let created = service.create_feature(
                layer(&feature.layer)?,
                feature.geometry.clone(),
                feature.properties.clone(),
            )?;
            features.push(created.id);
        }

        summary.views = views;
        summary.relations = relations;
        summary.features = features;
        Ok(summary)
    }
}
