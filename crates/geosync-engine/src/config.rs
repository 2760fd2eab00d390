//! Engine configuration.
//!
//! Defaults suit tests and small deployments. Values can be overridden from
//! a TOML document or from environment variables:
//! - `GEOSYNC_WORKERS`: number of queued-executor workers (default: 4)
//! - `GEOSYNC_MAX_ATTEMPTS`: deliveries per unit on retryable failures (default: 3)
//! - `GEOSYNC_MAX_CAS_ATTEMPTS`: write-back compare-and-save attempts (default: 3)
//! - `GEOSYNC_RETRY_BACKOFF_MS`: pause before redelivery (default: 50)

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub max_cas_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers: 4,
            max_attempts: 3,
            max_cas_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl EngineConfig {
    /// Applies `GEOSYNC_*` overrides looked up through `lookup`, usually
    /// `std::env::var`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GEOSYNC_WORKERS") {
            self.workers = parse_var("GEOSYNC_WORKERS", &v)?;
        }
        if let Some(v) = lookup("GEOSYNC_MAX_ATTEMPTS") {
            self.max_attempts = parse_var("GEOSYNC_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("GEOSYNC_MAX_CAS_ATTEMPTS") {
            self.max_cas_attempts = parse_var("GEOSYNC_MAX_CAS_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("GEOSYNC_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = parse_var("GEOSYNC_RETRY_BACKOFF_MS", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be at least 1".into()));
        }
        if self.max_attempts == 0 || self.max_cas_attempts == 0 {
            return Err(SyncError::Config("attempt limits must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, SyncError> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{key}: cannot parse '{value}'")))
}
