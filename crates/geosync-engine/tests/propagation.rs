//! End-to-end propagation through GeoService with the inline executor.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use geosync_core::feature::Properties;
use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId, ViewId};
use geosync_core::relation::RelationType;
use geosync_core::schema::{CrudView, CrudViewProperty, PropertyType};
use geosync_engine::builtins::{default_registry, register_spec, FunctionSpec};
use geosync_engine::{EngineConfig, GeoService, Outcome, PropertySelection, SyncError};
use geosync_storage::{InMemoryStore, RelationStore, SchemaStore, SqliteStore, Store};

struct World {
    service: GeoService,
    lines: LayerId,
    cities: LayerId,
}

/// Lines carry `length` and `cities` (names of intersecting cities).
/// Cities carry an editable `name` and, optionally, `line_count`.
fn world_on(store: Arc<dyn Store>, cities_count_lines: bool) -> World {
    let mut registry = default_registry();
    register_spec(
        &mut registry,
        "city_names",
        &FunctionSpec::RelatedProperty {
            relation: "crosses".into(),
            property: "name".into(),
        },
    );
    register_spec(
        &mut registry,
        "line_count",
        &FunctionSpec::RelatedCount {
            relation: "crosses".into(),
        },
    );
    let service = GeoService::inline(store, registry, EngineConfig::default()).unwrap();

    let lines = service.create_layer("Lines").unwrap();
    let cities = service.create_layer("Cities").unwrap();
    service
        .register_view(&CrudView {
            id: ViewId(1),
            name: "Lines".into(),
            layer: lines,
            properties: vec![
                CrudViewProperty::editable("name", Some(PropertyType::String)),
                CrudViewProperty::computed("length", "length", Some(PropertyType::Number)),
                CrudViewProperty::computed("cities", "city_names", Some(PropertyType::Array)),
            ],
        })
        .unwrap();
    let mut city_props = vec![CrudViewProperty::editable("name", Some(PropertyType::String))];
    if cities_count_lines {
        city_props.push(CrudViewProperty::computed(
            "line_count",
            "line_count",
            Some(PropertyType::Integer),
        ));
    }
    service
        .register_view(&CrudView {
            id: ViewId(2),
            name: "Cities".into(),
            layer: cities,
            properties: city_props,
        })
        .unwrap();
    service
        .create_relation("crosses", lines, cities, RelationType::Intersects)
        .unwrap();
    World {
        service,
        lines,
        cities,
    }
}

fn world(cities_count_lines: bool) -> World {
    world_on(Arc::new(InMemoryStore::new()), cities_count_lines)
}

fn unit_line() -> Geometry {
    Geometry::line([(0.0, 0.0), (1.0, 0.0)])
}

fn props(service: &GeoService, id: FeatureId) -> Properties {
    service.feature(id).unwrap().properties
}

#[test]
fn lines_and_cities_scenario() {
    let w = world(false);
    let f1 = w
        .service
        .create_feature(w.lines, unit_line(), Properties::new())
        .unwrap();
    let expected: Properties = [("length", json!(1.0)), ("cities", json!([]))]
        .into_iter()
        .collect();
    assert_eq!(props(&w.service, f1.id), expected);

    w.service
        .create_feature(
            w.cities,
            Geometry::rect((0.0, 0.0), (1.0, 1.0)),
            Properties::new().with("name", json!("Town")),
        )
        .unwrap();
    assert_eq!(props(&w.service, f1.id).get("cities"), Some(&json!(["Town"])));
    assert!(w.service.take_failures().is_empty());
}

#[test]
fn scenario_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("geosync.db");
    let store = SqliteStore::new(path.to_str().unwrap()).unwrap();
    let w = world_on(Arc::new(store), false);
    let f1 = w
        .service
        .create_feature(w.lines, unit_line(), Properties::new())
        .unwrap();
    w.service
        .create_feature(
            w.cities,
            Geometry::rect((0.0, 0.0), (1.0, 1.0)),
            Properties::new().with("name", json!("Town")),
        )
        .unwrap();
    let stored = props(&w.service, f1.id);
    assert_eq!(stored.get("length"), Some(&json!(1.0)));
    assert_eq!(stored.get("cities"), Some(&json!(["Town"])));
}

#[test]
fn origin_geometry_change_drops_city_and_nothing_else() {
    let w = world(true);
    let f1 = w
        .service
        .create_feature(w.lines, unit_line(), Properties::new().with("name", json!("A1")))
        .unwrap();
    let town = w
        .service
        .create_feature(
            w.cities,
            Geometry::rect((0.0, 0.0), (1.0, 1.0)),
            Properties::new().with("name", json!("Town")),
        )
        .unwrap();
    assert_eq!(props(&w.service, f1.id).get("cities"), Some(&json!(["Town"])));
    assert_eq!(props(&w.service, town.id).get("line_count"), Some(&json!(1)));

    w.service
        .update_geometry(f1.id, Geometry::line([(5.0, 5.0), (6.0, 5.0)]))
        .unwrap();

    let after = props(&w.service, f1.id);
    assert_eq!(after.get("cities"), Some(&json!([])));
    assert_eq!(after.get("name"), Some(&json!("A1")));
    assert_eq!(after.get("length"), Some(&json!(1.0)));
    // The city it moved away from no longer counts it.
    assert_eq!(props(&w.service, town.id).get("line_count"), Some(&json!(0)));
}

#[test]
fn destination_property_edit_reaches_origin() {
    let w = world(false);
    let f1 = w
        .service
        .create_feature(w.lines, unit_line(), Properties::new())
        .unwrap();
    let town = w
        .service
        .create_feature(
            w.cities,
            Geometry::rect((0.0, 0.0), (1.0, 1.0)),
            Properties::new().with("name", json!("Town")),
        )
        .unwrap();
    w.service
        .update_properties(town.id, &BTreeMap::from([("name".to_string(), json!("City"))]))
        .unwrap();
    assert_eq!(props(&w.service, f1.id).get("cities"), Some(&json!(["City"])));
}

#[test]
fn deleting_either_side_updates_the_other() {
    let w = world(true);
    let f1 = w
        .service
        .create_feature(w.lines, unit_line(), Properties::new())
        .unwrap();
    let town = w
        .service
        .create_feature(
            w.cities,
            Geometry::rect((0.0, 0.0), (1.0, 1.0)),
            Properties::new().with("name", json!("Town")),
        )
        .unwrap();
    let village = w
        .service
        .create_feature(
            w.cities,
            Geometry::rect((0.5, -1.0), (0.7, 1.0)),
            Properties::new().with("name", json!("Village")),
        )
        .unwrap();
    assert_eq!(
        props(&w.service, f1.id).get("cities"),
        Some(&json!(["Town", "Village"]))
    );

    w.service.delete_feature(town.id).unwrap();
    assert_eq!(props(&w.service, f1.id).get("cities"), Some(&json!(["Village"])));

    w.service.delete_feature(f1.id).unwrap();
    assert_eq!(props(&w.service, village.id).get("line_count"), Some(&json!(0)));
    assert!(w.service.take_failures().is_empty());
}

#[test]
fn relation_redefinition_and_deletion_cascade() {
    let w = world(false);
    let f1 = w
        .service
        .create_feature(w.lines, unit_line(), Properties::new())
        .unwrap();
    w.service
        .create_feature(
            w.cities,
            Geometry::rect((0.0, 2.0), (1.0, 3.0)),
            Properties::new().with("name", json!("Far")),
        )
        .unwrap();
    assert_eq!(props(&w.service, f1.id).get("cities"), Some(&json!([])));

    let mut relation = w
        .service
        .store()
        .find_relation_by_name("crosses")
        .unwrap()
        .unwrap();
    relation.relation_type = RelationType::Distance { distance: 5.0 };
    w.service.update_relation(&relation).unwrap();
    assert_eq!(props(&w.service, f1.id).get("cities"), Some(&json!(["Far"])));

    w.service.delete_relation(relation.id).unwrap();
    assert_eq!(props(&w.service, f1.id).get("cities"), Some(&json!([])));
}

#[test]
fn view_registration_computes_existing_features() {
    let store = Arc::new(InMemoryStore::new());
    let service = GeoService::inline(store, default_registry(), EngineConfig::default()).unwrap();
    let layer = service.create_layer("Parcels").unwrap();
    let parcel = service
        .create_feature(layer, Geometry::rect((0.0, 0.0), (2.0, 3.0)), Properties::new())
        .unwrap();
    assert!(props(&service, parcel.id).is_empty());

    service
        .register_view(&CrudView {
            id: ViewId(7),
            name: "Parcels".into(),
            layer,
            properties: vec![CrudViewProperty::computed("area", "area", None)],
        })
        .unwrap();
    assert_eq!(props(&service, parcel.id).get("area"), Some(&json!(6.0)));
}

#[test]
fn unknown_function_is_rejected_at_registration() {
    let w = world(false);
    let err = w
        .service
        .register_view(&CrudView {
            id: ViewId(3),
            name: "Broken".into(),
            layer: w.lines,
            properties: vec![CrudViewProperty::computed("x", "no_such_function", None)],
        })
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownFunction { .. }));
    // The previous view is still in place.
    let view = w.service.store().view_for_layer(w.lines).unwrap().unwrap();
    assert_eq!(view.id, ViewId(1));
}

#[test]
fn recompute_of_deleted_feature_is_a_no_op() {
    let w = world(false);
    let f1 = w
        .service
        .create_feature(w.lines, unit_line(), Properties::new())
        .unwrap();
    w.service.delete_feature(f1.id).unwrap();
    assert_eq!(
        w.service.recompute(f1.id, &PropertySelection::All).unwrap(),
        Outcome::Gone
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn recompute_twice_is_stable(
        coords in prop::collection::vec((-100.0f64..100.0, -100.0f64..100.0), 2..6)
    ) {
        let w = world(false);
        let f = w
            .service
            .create_feature(w.lines, Geometry::line(coords), Properties::new())
            .unwrap();
        let settled = w.service.feature(f.id).unwrap();
        let again = w.service.recompute(f.id, &PropertySelection::All).unwrap();
        prop_assert_eq!(again, Outcome::Unchanged);
        prop_assert_eq!(w.service.feature(f.id).unwrap(), settled);
    }
}
