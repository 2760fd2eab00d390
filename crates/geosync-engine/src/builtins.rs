//! Builtin computed-property functions and their declarative form.
//!
//! Deployments declare functions in configuration as [`FunctionDecl`]
//! entries, e.g.
//!
//! ```toml
//! [[functions]]
//! name = "cities"
//! kind = "related_property"
//! relation = "cities"
//! property = "name"
//! ```
//!
//! and [`register_decls`] turns them into registry entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::{ComputeContext, FunctionDependency, FunctionError, FunctionRegistry};

/// Which builtin a declared function instantiates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunctionSpec {
    /// Geometry length (perimeter for polygons).
    Length,
    /// Polygon area.
    Area,
    /// Values of `property` on features related through `relation`, in
    /// feature ID order. Features lacking the property are skipped.
    RelatedProperty { relation: String, property: String },
    /// Number of features related through `relation`.
    RelatedCount { relation: String },
}

/// A named function declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(flatten)]
    pub spec: FunctionSpec,
}

pub fn length(ctx: &ComputeContext<'_>) -> Result<Value, FunctionError> {
    Ok(Value::from(ctx.geometry().length()))
}

pub fn area(ctx: &ComputeContext<'_>) -> Result<Value, FunctionError> {
    Ok(Value::from(ctx.geometry().area()))
}

pub fn related_property(
    ctx: &ComputeContext<'_>,
    relation: &str,
    property: &str,
) -> Result<Value, FunctionError> {
    let values = ctx
        .related(relation)?
        .into_iter()
        .filter_map(|f| f.properties.get(property).cloned())
        .filter(|v| !v.is_null())
        .collect();
    Ok(Value::Array(values))
}

pub fn related_count(ctx: &ComputeContext<'_>, relation: &str) -> Result<Value, FunctionError> {
    Ok(Value::from(ctx.related(relation)?.len()))
}

/// Registers one declared function.
pub fn register_spec(registry: &mut FunctionRegistry, name: &str, spec: &FunctionSpec) {
    match spec.clone() {
        FunctionSpec::Length => registry.register(name, FunctionDependency::Local, length),
        FunctionSpec::Area => registry.register(name, FunctionDependency::Local, area),
        FunctionSpec::RelatedProperty { relation, property } => registry.register(
            name,
            FunctionDependency::Relational,
            move |ctx| related_property(ctx, &relation, &property),
        ),
        FunctionSpec::RelatedCount { relation } => registry.register(
            name,
            FunctionDependency::Relational,
            move |ctx| related_count(ctx, &relation),
        ),
    }
}

/// Registers every declaration, later entries replacing earlier ones.
pub fn register_decls(registry: &mut FunctionRegistry, decls: &[FunctionDecl]) {
    for decl in decls {
        register_spec(registry, &decl.name, &decl.spec);
    }
}

/// A registry preloaded with `length` and `area`.
pub fn default_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    register_spec(&mut registry, "length", &FunctionSpec::Length);
    register_spec(&mut registry, "area", &FunctionSpec::Area);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosync_core::feature::Properties;
    use geosync_core::geometry::Geometry;
    use geosync_core::relation::RelationType;
    use geosync_storage::{FeatureStore, InMemoryStore, RelationStore, SchemaStore};
    use serde_json::json;

    #[test]
    fn decl_parses_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            functions: Vec<FunctionDecl>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[functions]]
            name = "cities"
            kind = "related_property"
            relation = "cities"
            property = "name"

            [[functions]]
            name = "len"
            kind = "length"
            "#,
        )
        .unwrap();
        assert_eq!(
            doc.functions[0].spec,
            FunctionSpec::RelatedProperty {
                relation: "cities".into(),
                property: "name".into()
            }
        );
        assert_eq!(doc.functions[1].spec, FunctionSpec::Length);
    }

    #[test]
    fn related_property_collects_names_in_id_order() {
        let store = InMemoryStore::new();
        let lines = store.create_layer("lines").unwrap();
        let cities = store.create_layer("cities").unwrap();
        store
            .create_relation("cities", lines, cities, RelationType::Intersects)
            .unwrap();
        let line = store
            .insert_feature(lines, Geometry::line([(0.0, 0.0), (10.0, 0.0)]), Properties::new())
            .unwrap();
        for (x, name) in [(1.0, json!("A")), (5.0, json!("B"))] {
            store
                .insert_feature(
                    cities,
                    Geometry::rect((x, -1.0), (x + 1.0, 1.0)),
                    Properties::new().with("name", name),
                )
                .unwrap();
        }
        // Related but unnamed: skipped.
        store
            .insert_feature(cities, Geometry::rect((8.0, -1.0), (9.0, 1.0)), Properties::new())
            .unwrap();

        let mut registry = FunctionRegistry::new();
        register_decls(
            &mut registry,
            &[
                FunctionDecl {
                    name: "cities".into(),
                    spec: FunctionSpec::RelatedProperty {
                        relation: "cities".into(),
                        property: "name".into(),
                    },
                },
                FunctionDecl {
                    name: "city_count".into(),
                    spec: FunctionSpec::RelatedCount {
                        relation: "cities".into(),
                    },
                },
            ],
        );

        let ctx = ComputeContext::new(&line, &store);
        let names = registry.resolve("cities").unwrap().call(&ctx).unwrap();
        assert_eq!(names, json!(["A", "B"]));
        let count = registry.resolve("city_count").unwrap().call(&ctx).unwrap();
        assert_eq!(count, json!(3));
    }

    #[test]
    fn missing_relation_relates_nothing() {
        let store = InMemoryStore::new();
        let lines = store.create_layer("lines").unwrap();
        let line = store
            .insert_feature(lines, Geometry::point(0.0, 0.0), Properties::new())
            .unwrap();
        let ctx = ComputeContext::new(&line, &store);
        assert_eq!(related_count(&ctx, "nope").unwrap(), json!(0));
        assert_eq!(related_property(&ctx, "nope", "name").unwrap(), json!([]));
    }

    #[test]
    fn default_registry_has_geometry_functions() {
        let registry = default_registry();
        let store = InMemoryStore::new();
        let layer = store.create_layer("l").unwrap();
        let f = store
            .insert_feature(layer, Geometry::line([(0.0, 0.0), (1.0, 0.0)]), Properties::new())
            .unwrap();
        let ctx = ComputeContext::new(&f, &store);
        assert_eq!(registry.resolve("length").unwrap().call(&ctx).unwrap(), json!(1.0));
        assert!(!registry.resolve("area").unwrap().is_relational());
    }
}
