//! Features, their properties bag, and write scoping.
//!
//! A [`Properties`] bag is an immutable-per-read value: writers never
//! mutate a bag obtained from a store in place, they build a new one with
//! [`Properties::merged_with`] or [`Properties::with`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geometry::Geometry;
use crate::id::{FeatureId, LayerId};

/// The untyped properties of a feature, keyed by property name.
///
/// Keys are kept ordered so that serialization (and therefore hashing) is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Properties(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy of this bag with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.0.clone();
        next.insert(key.into(), value);
        Properties(next)
    }

    /// Returns a copy of this bag with every entry of `updates` applied.
    /// Keys absent from `updates` keep their current value.
    pub fn merged_with(&self, updates: &BTreeMap<String, Value>) -> Self {
        let mut next = self.0.clone();
        for (key, value) in updates {
            next.insert(key.clone(), value.clone());
        }
        Properties(next)
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl From<BTreeMap<String, Value>> for Properties {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Properties(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Properties {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Properties(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A single geometry + properties record belonging to a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub layer: LayerId,
    pub geometry: Geometry,
    pub properties: Properties,
    /// Bumped by every persisted save. Used as the compare-and-swap token.
    pub version: u64,
}

impl Feature {
    /// Returns a copy of this feature carrying a new properties bag.
    pub fn with_properties(&self, properties: Properties) -> Self {
        Feature {
            properties,
            ..self.clone()
        }
    }

    /// Returns a copy of this feature carrying a new geometry.
    pub fn with_geometry(&self, geometry: Geometry) -> Self {
        Feature {
            geometry,
            ..self.clone()
        }
    }
}

/// A persisted field of a feature that a write may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureField {
    Geometry,
    Properties,
    Layer,
}

/// Who issued a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOrigin {
    /// A user, API call or import.
    External,
    /// The computation engine writing back computed properties.
    Engine,
}

/// The declared extent of a write: which fields were meant to change, and
/// by whom.
///
/// `fields == None` is an unscoped write, treated as touching every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteScope {
    pub fields: Option<BTreeSet<FeatureField>>,
    pub origin: WriteOrigin,
}

impl WriteScope {
    /// An external write touching every field.
    pub fn unscoped() -> Self {
        WriteScope {
            fields: None,
            origin: WriteOrigin::External,
        }
    }

    /// An external write limited to the given fields.
    pub fn fields<I: IntoIterator<Item = FeatureField>>(fields: I) -> Self {
        WriteScope {
            fields: Some(fields.into_iter().collect()),
            origin: WriteOrigin::External,
        }
    }

    /// The write-back issued by the computation engine: properties only.
    pub fn engine() -> Self {
        WriteScope {
            fields: Some(BTreeSet::from([FeatureField::Properties])),
            origin: WriteOrigin::Engine,
        }
    }

    pub fn touches(&self, field: FeatureField) -> bool {
        self.fields.as_ref().map_or(true, |f| f.contains(&field))
    }

    /// True for the engine's own properties-only write-back. Such writes
    /// must never schedule another self-recomputation.
    pub fn is_self_recomputation(&self) -> bool {
        self.origin == WriteOrigin::Engine
            && self
                .fields
                .as_ref()
                .is_some_and(|f| f.len() == 1 && f.contains(&FeatureField::Properties))
    }
}

impl Default for WriteScope {
    fn default() -> Self {
        Self::unscoped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merged_with_keeps_unrelated_keys() {
        let base: Properties = [("name", json!("a")), ("length", json!(1.0))]
            .into_iter()
            .collect();
        let updates = BTreeMap::from([("length".to_string(), json!(2.0))]);
        let merged = base.merged_with(&updates);

        assert_eq!(merged.get("name"), Some(&json!("a")));
        assert_eq!(merged.get("length"), Some(&json!(2.0)));
        // The original bag is untouched.
        assert_eq!(base.get("length"), Some(&json!(1.0)));
    }

    #[test]
    fn unscoped_touches_everything() {
        let scope = WriteScope::unscoped();
        assert!(scope.touches(FeatureField::Geometry));
        assert!(scope.touches(FeatureField::Properties));
        assert!(!scope.is_self_recomputation());
    }

    #[test]
    fn engine_scope_is_self_recomputation() {
        assert!(WriteScope::engine().is_self_recomputation());
        // Same fields from an external caller is not.
        assert!(!WriteScope::fields([FeatureField::Properties]).is_self_recomputation());
    }

    #[test]
    fn engine_origin_with_wider_scope_is_not_self_recomputation() {
        let scope = WriteScope {
            fields: Some(BTreeSet::from([FeatureField::Properties, FeatureField::Geometry])),
            origin: WriteOrigin::Engine,
        };
        assert!(!scope.is_self_recomputation());
    }

    #[test]
    fn properties_serialize_as_plain_object() {
        let props = Properties::new().with("cities", json!(["Town"]));
        assert_eq!(serde_json::to_value(&props).unwrap(), json!({"cities": ["Town"]}));
    }
}
