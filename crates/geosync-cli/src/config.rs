//! CLI configuration file.
//!
//! ```toml
//! database = "geosync.db"
//!
//! [engine]
//! workers = 4
//! max_cas_attempts = 3
//!
//! [[functions]]
//! name = "city_names"
//! kind = "related_property"
//! relation = "crosses"
//! property = "name"
//! ```
//!
//! The database path is resolved as: `--db`, then `GEOSYNC_DB_PATH`, then
//! the file's `database`, then `geosync.db`. `GEOSYNC_*` engine variables
//! override the file's `[engine]` table.

use std::path::Path;

use serde::Deserialize;

use geosync_engine::builtins::{default_registry, register_decls};
use geosync_engine::{EngineConfig, FunctionDecl, FunctionRegistry};

use crate::CliError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub database: Option<String>,
    pub engine: EngineConfig,
    pub functions: Vec<FunctionDecl>,
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?;
                Self::parse(&text)?
            }
            None => CliConfig::default(),
        };
        let engine = config
            .engine
            .clone()
            .with_env_overrides(|key| std::env::var(key).ok())?;
        Ok(CliConfig { engine, ..config })
    }

    pub fn parse(text: &str) -> Result<Self, CliError> {
        let config: CliConfig = toml::from_str(text).map_err(|e| CliError::Config(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn database_path(&self, flag: Option<String>) -> String {
        flag.or_else(|| std::env::var("GEOSYNC_DB_PATH").ok())
            .or_else(|| self.database.clone())
            .unwrap_or_else(|| "geosync.db".to_string())
    }

    /// Builtins plus the declared functions.
    pub fn registry(&self) -> FunctionRegistry {
        let mut registry = default_registry();
        register_decls(&mut registry, &self.functions);
        registry
    }
}
