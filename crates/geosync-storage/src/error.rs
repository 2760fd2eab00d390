//! Storage error types for geosync-storage.
//!
//! [`StorageError`] covers all anticipated failure modes in the storage layer:
//! serialization, SQLite and migration failures, entity-not-found variants,
//! optimistic-concurrency version mismatches, and integrity violations.

use thiserror::Error;

use geosync_core::id::{FeatureId, LayerId, RelationId};
use geosync_core::CoreError;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The SQLite backend reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// A feature with the given ID was not found.
    #[error("feature not found: {0}")]
    FeatureNotFound(FeatureId),

    /// A relation with the given ID was not found.
    #[error("relation not found: {0}")]
    RelationNotFound(RelationId),

    /// A layer with the given ID was not found.
    #[error("layer not found: {0}")]
    LayerNotFound(LayerId),

    /// A compare-and-save found the feature at a different version.
    #[error("version mismatch for feature {feature}: expected {expected}, found {actual}")]
    VersionMismatch {
        feature: FeatureId,
        expected: u64,
        actual: u64,
    },

    /// A stored or submitted entity violated a data-model invariant.
    #[error("invalid data: {0}")]
    Invalid(#[from] CoreError),

    /// A data integrity violation was detected.
    #[error("integrity error: {reason}")]
    IntegrityError { reason: String },

    /// A backend lock was poisoned by a panicking writer.
    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// True for the benign "subject no longer exists" family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::FeatureNotFound(_)
                | StorageError::RelationNotFound(_)
                | StorageError::LayerNotFound(_)
        )
    }
}
