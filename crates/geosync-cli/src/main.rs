//! geosync command-line tool.
//!
//! Loads fixtures into a SQLite database and inspects or re-drives the
//! derived-property engine against it. Logging goes to stderr and is
//! controlled by `RUST_LOG`.

mod config;
mod fixture;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use petgraph::dot::Dot;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use geosync_core::id::{FeatureId, LayerId, RelationId};
use geosync_core::relation::RelationGraph;
use geosync_engine::{GeoService, Outcome, PropertySelection, SyncError};
use geosync_storage::{FeatureStore, RelationStore, SqliteStore, StorageError};

use crate::config::CliConfig;
use crate::fixture::Fixture;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("fixture: {0}")]
    Fixture(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CliError {
    /// 1 = failure, 2 = bad configuration or input, 4 = transient conflict.
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Fixture(_) => 2,
            CliError::Sync(e) if e.is_transient() => 4,
            CliError::Sync(SyncError::Config(_) | SyncError::UnknownFunction { .. }) => 2,
            _ => 1,
        }
    }
}

/// Derived-property synchronization tools.
#[derive(Parser)]
#[command(name = "geosync", about = "Derived-property synchronization tools")]
struct Cli {
    /// Database file (default: $GEOSYNC_DB_PATH, then the config file, then geosync.db).
    #[arg(long, global = true)]
    db: Option<String>,

    /// TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run propagation on the tokio worker pool instead of inline.
    #[arg(long, global = true)]
    queued: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a JSON fixture (layers, views, relations, features).
    Load { path: PathBuf },

    /// Print a feature as JSON.
    Show { feature: i64 },

    /// Print every feature of a layer as JSON.
    Features { layer: u32 },

    /// Recompute a feature's computed properties.
    Recompute {
        feature: i64,

        /// Only these keys (comma separated).
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
    },

    /// Re-run the recomputation cascade of a relation.
    RefreshRelation { relation: u32 },

    /// Print the layer relation graph in Graphviz DOT format.
    Relations,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = CliConfig::load(cli.config.as_deref())?;
    let db_path = config.database_path(cli.db);
    info!(db = %db_path, "opening database");
    let store = Arc::new(SqliteStore::new(&db_path)?);

    if let Commands::Relations = cli.command {
        let graph = RelationGraph::from_relations(&store.list_relations()?);
        println!("{}", Dot::new(graph.inner()));
        return Ok(());
    }

    let service = if cli.queued {
        GeoService::queued(store, config.registry(), config.engine.clone())?
    } else {
        GeoService::inline(store, config.registry(), config.engine.clone())?
    };

    let result = execute(&service, cli.command);
    service.settle().await;
    for failure in service.take_failures() {
        eprintln!(
            "warning: {} failed after {} attempt(s): {}",
            failure.unit, failure.attempts, failure.error
        );
    }
    service.shutdown().await;
    result
}

fn execute(service: &GeoService, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Load { path } => {
            let text = std::fs::read_to_string(&path)?;
            let summary = Fixture::parse(&text)?.load(service)?;
            print_json(&summary)
        }
        Commands::Show { feature } => print_json(&service.feature(FeatureId(feature))?),
        Commands::Features { layer } => {
            print_json(&service.store().features_in_layer(LayerId(layer))?)
        }
        Commands::Recompute { feature, keys } => {
            let selection = if keys.is_empty() {
                PropertySelection::All
            } else {
                PropertySelection::keys(keys)
            };
            let status = match service.recompute(FeatureId(feature), &selection)? {
                Outcome::Success { feature, .. } => {
                    print_json(&feature)?;
                    return Ok(());
                }
                Outcome::Unchanged => "unchanged",
                Outcome::Gone => "gone",
            };
            println!("{status}");
            Ok(())
        }
        Commands::RefreshRelation { relation } => {
            let units = service.refresh_relation(RelationId(relation))?;
            println!("scheduled {units} unit(s)");
            Ok(())
        }
        Commands::Relations => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value).map_err(StorageError::from)?;
    println!("{json}");
    Ok(())
}
