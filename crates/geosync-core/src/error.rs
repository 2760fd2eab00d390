//! Core error types for geosync-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! invariants of the data model.

use thiserror::Error;

use crate::id::{RelationId, ViewId};

/// Core errors produced by the geosync-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A geometry failed structural validation.
    #[error("invalid geometry: {reason}")]
    InvalidGeometry { reason: String },

    /// Two properties of the same view share a key.
    #[error("duplicate property key '{key}' in view {view}")]
    DuplicatePropertyKey { view: ViewId, key: String },

    /// A view declaration violates a schema invariant.
    #[error("invalid schema for view {view}: {reason}")]
    InvalidSchema { view: ViewId, reason: String },

    /// A relation definition is malformed.
    #[error("invalid relation {relation}: {reason}")]
    InvalidRelation { relation: RelationId, reason: String },
}
