//! Storage abstraction for geosync.
//!
//! Provides the collaborator contracts the synchronization engine consumes
//! ([`FeatureStore`], [`RelationStore`], [`SchemaStore`], bundled as
//! [`Store`]) plus the [`InMemoryStore`] and [`SqliteStore`] backends.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`traits`]: the storage traits
//! - [`hash`]: blake3 property hashing and per-key snapshots
//! - [`dirty`]: key-level diff between two properties bags
//! - [`memory`]: InMemoryStore implementation
//! - [`schema`]: SQL migration setup
//! - [`sqlite`]: SqliteStore implementation

pub mod dirty;
pub mod error;
pub mod hash;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod traits;

// Re-export key types for ergonomic use.
pub use dirty::{diff_properties, PropertyDiff};
pub use error::StorageError;
pub use hash::{hash_value, PropertySnapshot};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{FeatureStore, RelationStore, SchemaStore, Store};
