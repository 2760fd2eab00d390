//! CRUD view and property schema declarations.
//!
//! A [`CrudView`] is the configured presentation of one layer. Its
//! [`CrudViewProperty`] entries declare the semantic type of each key in
//! the features' properties bag, and which keys are computed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::id::{LayerId, ViewId};

/// Declared JSON type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl PropertyType {
    /// Whether `value` conforms to this type. `null` is always accepted:
    /// it is how an unset property is represented.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (PropertyType::String, Value::String(_)) => true,
            (PropertyType::Number, Value::Number(_)) => true,
            (PropertyType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (PropertyType::Boolean, Value::Bool(_)) => true,
            (PropertyType::Array, Value::Array(_)) => true,
            (PropertyType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// One declared property of a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudViewProperty {
    /// Key in the properties bag. Unique per view.
    pub key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_editable")]
    pub editable: bool,
    /// Name of a registered computation function.
    #[serde(default)]
    pub function_path: Option<String>,
    #[serde(default)]
    pub value_type: Option<PropertyType>,
}

fn default_editable() -> bool {
    true
}

impl CrudViewProperty {
    /// A plain user-editable property.
    pub fn editable(key: impl Into<String>, value_type: Option<PropertyType>) -> Self {
        CrudViewProperty {
            key: key.into(),
            title: None,
            editable: true,
            function_path: None,
            value_type,
        }
    }

    /// A read-only property derived by the named function.
    pub fn computed(
        key: impl Into<String>,
        function_path: impl Into<String>,
        value_type: Option<PropertyType>,
    ) -> Self {
        CrudViewProperty {
            key: key.into(),
            title: None,
            editable: false,
            function_path: Some(function_path.into()),
            value_type,
        }
    }

    /// A property is computed iff it is not editable and names a function.
    pub fn is_computed(&self) -> bool {
        !self.editable && self.computed_function().is_some()
    }

    /// The function path, if present and non-empty.
    pub fn computed_function(&self) -> Option<&str> {
        self.function_path.as_deref().filter(|p| !p.trim().is_empty())
    }
}

/// A configured CRUD presentation over one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudView {
    pub id: ViewId,
    pub name: String,
    pub layer: LayerId,
    #[serde(default)]
    pub properties: Vec<CrudViewProperty>,
}

impl CrudView {
    pub fn property(&self, key: &str) -> Option<&CrudViewProperty> {
        self.properties.iter().find(|p| p.key == key)
    }

    pub fn computed_properties(&self) -> impl Iterator<Item = &CrudViewProperty> {
        self.properties.iter().filter(|p| p.is_computed())
    }

    pub fn is_computed_key(&self, key: &str) -> bool {
        self.property(key).is_some_and(CrudViewProperty::is_computed)
    }

    /// Checks per-view invariants: property keys are unique and non-empty.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for prop in &self.properties {
            if prop.key.is_empty() {
                return Err(CoreError::InvalidSchema {
                    view: self.id,
                    reason: "empty property key".into(),
                });
            }
            if !seen.insert(prop.key.as_str()) {
                return Err(CoreError::DuplicatePropertyKey {
                    view: self.id,
                    key: prop.key.clone(),
                });
            }
        }
        Ok(())
    }
}
