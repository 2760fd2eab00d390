//! Engine error types.
//!
//! [`SyncError`] is the unified error of the computation and propagation
//! pipeline. Benign outcomes (feature or relation gone) are not errors;
//! they are reported through [`crate::compute::Outcome`] and
//! [`crate::runner::UnitOutcome`].

use thiserror::Error;

use geosync_core::id::{FeatureId, ViewId};
use geosync_core::CoreError;
use geosync_storage::StorageError;

/// Errors produced by the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Computed keys this invocation was about to write were changed by
    /// another writer since they were read. Never retried automatically.
    #[error("concurrent modification of {keys:?} on feature {feature}")]
    ConcurrentPropertyModification { feature: FeatureId, keys: Vec<String> },

    /// A view names a computation function that is not registered.
    #[error("unknown function '{function}' for property '{key}' of view {view}")]
    UnknownFunction {
        view: ViewId,
        key: String,
        function: String,
    },

    /// Rejected input (invalid geometry, malformed view).
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// Configuration could not be loaded or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A propagation unit could not be executed (worker crashed, queue
    /// closed).
    #[error("execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Transient conflicts are distinguishable from permanent failures:
    /// the caller may re-trigger after re-reading its inputs.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::ConcurrentPropertyModification { .. })
    }

    /// Whether the task executor may blindly redeliver the unit.
    ///
    /// Storage hiccups are retryable. A lost-update conflict is not: the
    /// same inputs would produce the same conflict.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Storage(err) => {
                !err.is_not_found() && !matches!(err, StorageError::Invalid(_))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_transient_but_not_retryable() {
        let err = SyncError::ConcurrentPropertyModification {
            feature: FeatureId(1),
            keys: vec!["length".into()],
        };
        assert!(err.is_transient());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "concurrent modification of [\"length\"] on feature 1"
        );
    }

    #[test]
    fn storage_failures_are_retryable_except_not_found() {
        assert!(SyncError::Storage(StorageError::LockPoisoned).is_retryable());
        assert!(!SyncError::Storage(StorageError::FeatureNotFound(FeatureId(2))).is_retryable());
        assert!(!SyncError::Storage(StorageError::LockPoisoned).is_transient());
    }
}
