//! Typed registry of computed-property functions.
//!
//! Views reference functions by name (`function_path`). Names are resolved
//! against a [`FunctionRegistry`] populated at startup; an unknown name is a
//! configuration error raised when a view is registered, never at
//! computation time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use geosync_core::feature::Feature;
use geosync_core::geometry::Geometry;
use geosync_core::schema::CrudView;
use geosync_storage::{RelationStore, StorageError, Store};

use crate::error::SyncError;

/// What a function reads besides the feature itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionDependency {
    /// Own geometry and properties only.
    Local,
    /// Also queries features related through layer relations.
    Relational,
}

/// Failure of a single function invocation.
#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("{0}")]
    Failed(String),

    #[error("related feature query failed: {0}")]
    Storage(#[from] StorageError),
}

/// Signature of a computed-property function.
pub type ComputeFn = dyn Fn(&ComputeContext<'_>) -> Result<Value, FunctionError> + Send + Sync;

/// Input handed to a function: the feature as read, plus read access to
/// related features.
pub struct ComputeContext<'a> {
    feature: &'a Feature,
    store: &'a dyn Store,
}

impl<'a> ComputeContext<'a> {
    pub fn new(feature: &'a Feature, store: &'a dyn Store) -> Self {
        ComputeContext { feature, store }
    }

    pub fn feature(&self) -> &Feature {
        self.feature
    }

    pub fn geometry(&self) -> &Geometry {
        &self.feature.geometry
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.feature.properties.get(key)
    }

    /// Features related to this one through the relation named
    /// `relation_name`, in feature ID order. Empty if no such relation
    /// touches the feature's layer (e.g. it was deleted).
    pub fn related(&self, relation_name: &str) -> Result<Vec<Feature>, FunctionError> {
        let relation = self
            .store
            .list_relations()?
            .into_iter()
            .find(|r| r.name == relation_name && r.touches_layer(self.feature.layer));
        match relation {
            Some(relation) => Ok(self.store.resolve_related(self.feature, &relation)?),
            None => {
                debug!(feature = %self.feature.id, relation = relation_name, "no such relation on layer");
                Ok(Vec::new())
            }
        }
    }
}

/// A named function and its dependency class.
#[derive(Clone)]
pub struct RegisteredFunction {
    pub name: String,
    pub dependency: FunctionDependency,
    func: Arc<ComputeFn>,
}

impl RegisteredFunction {
    pub fn call(&self, ctx: &ComputeContext<'_>) -> Result<Value, FunctionError> {
        (self.func)(ctx)
    }

    pub fn is_relational(&self) -> bool {
        self.dependency == FunctionDependency::Relational
    }
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("dependency", &self.dependency)
            .finish_non_exhaustive()
    }
}

/// Name -> function table.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `func` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, dependency: FunctionDependency, func: F)
    where
        F: Fn(&ComputeContext<'_>) -> Result<Value, FunctionError> + Send + Sync + 'static,
    {
        let name = name.into();
        self.functions.insert(
            name.clone(),
            RegisteredFunction {
                name,
                dependency,
                func: Arc::new(func),
            },
        );
    }

    /// Builder-style [`FunctionRegistry::register`].
    pub fn with<F>(
        mut self,
        name: impl Into<String>,
        dependency: FunctionDependency,
        func: F,
    ) -> Self
    where
        F: Fn(&ComputeContext<'_>) -> Result<Value, FunctionError> + Send + Sync + 'static,
    {
        self.register(name, dependency, func);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<&RegisteredFunction> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Checks that every computed property of `view` names a registered
    /// function.
    pub fn validate_view(&self, view: &CrudView) -> Result<(), SyncError> {
        for prop in view.computed_properties() {
            let Some(function) = prop.computed_function() else {
                continue;
            };
            if !self.contains(function) {
                return Err(SyncError::UnknownFunction {
                    view: view.id,
                    key: prop.key.clone(),
                    function: function.to_string(),
                });
            }
        }
        Ok(())
    }

    /// True if the view declares at least one computed property whose
    /// function queries relations.
    pub fn has_relational_properties(&self, view: &CrudView) -> bool {
        view.computed_properties()
            .filter_map(|p| p.computed_function())
            .filter_map(|name| self.resolve(name))
            .any(RegisteredFunction::is_relational)
    }
}
