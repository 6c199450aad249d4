// Store Configuration
//
// Loaded from an optional JSON file, then overridden from the
// environment. Every key has a default, so an empty object is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schema::policy::DriftPolicy;

/// Environment variable overriding `database_path`.
pub const DATABASE_PATH_ENV: &str = "CLAPS_DATABASE_PATH";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,

    /// How long a unit of work waits for a database lock.
    pub busy_timeout_ms: u64,

    /// Upper bound on a single statement.
    pub statement_timeout_ms: u64,

    pub drift_policy: DriftPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("claps.db"),
            busy_timeout_ms: 5_000,
            statement_timeout_ms: 30_000,
            drift_policy: DriftPolicy::default_policy(),
        }
    }
}

impl StoreConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup(DATABASE_PATH_ENV).filter(|p| !p.is_empty()) {
            self.database_path = PathBuf::from(path);
        }
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}
