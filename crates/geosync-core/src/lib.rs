//! Data model for geosync: features, their properties bag, layer views with
//! computed property declarations, and spatial layer relations.

pub mod error;
pub mod feature;
pub mod geometry;
pub mod id;
pub mod relation;
pub mod schema;

// Re-export commonly used types
pub use error::CoreError;
pub use feature::{Feature, FeatureField, Properties, WriteOrigin, WriteScope};
pub use geometry::{Coord, Geometry};
pub use id::{FeatureId, LayerId, RelationId, ViewId};
pub use relation::{LayerRelation, RelationGraph, RelationType};
pub use schema::{CrudView, CrudViewProperty, PropertyType};
