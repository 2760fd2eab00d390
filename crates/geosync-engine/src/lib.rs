//! Derived-property synchronization for geosync.
//!
//! Keeps computed feature properties consistent with the features they are
//! derived from, across layer relations and under concurrent writes.
//!
//! # Modules
//!
//! - [`registry`] / [`builtins`]: named computation functions
//! - [`compute`]: ComputationEngine (evaluate, guard, write back)
//! - [`guard`]: optimistic concurrency check on computed keys
//! - [`scheduler`]: decides which units a write requires
//! - [`unit`]: propagation unit descriptors
//! - [`queue`]: inline and tokio task queues
//! - [`runner`]: executes units
//! - [`service`]: GeoService write path
//! - [`config`], [`error`]

pub mod builtins;
pub mod compute;
pub mod config;
pub mod error;
pub mod guard;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod unit;

pub use builtins::{default_registry, FunctionDecl, FunctionSpec};
pub use compute::{ComputationEngine, Outcome};
pub use config::EngineConfig;
pub use error::SyncError;
pub use guard::{ConcurrencyGuard, GuardState};
pub use queue::{InlineQueue, TaskQueue, TokioQueue, UnitFailure, UnitHandler};
pub use registry::{ComputeContext, FunctionDependency, FunctionError, FunctionRegistry};
pub use runner::{UnitOutcome, UnitRunner};
pub use scheduler::{PropagationScheduler, WrittenFeature};
pub use service::GeoService;
pub use unit::{PropagationUnit, PropertySelection, Reason, UnitKind};
