//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::bootstrap::{default_parallelism, BootstrapConfig};
use crate::downsample::{SchemaDefinition, SchemaSet};
use crate::error::BootstrapResult;
use crate::source::DEFAULT_SCAN_BATCH_SIZE;
use crate::types::{ShardRef, MILLIS_PER_HOUR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub bootstrap: BootstrapSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Column store and index file locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Rows fetched per page when scanning the column store
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("chronicle-index").to_string_lossy().to_string())
        .unwrap_or_else(|| "./chronicle_index_data".to_string())
}

fn default_scan_batch_size() -> usize {
    DEFAULT_SCAN_BATCH_SIZE
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scan_batch_size: default_scan_batch_size(),
        }
    }
}

impl StoreConfig {
    /// `data_dir` with a leading `~/` expanded to the home directory
    pub fn data_path(&self) -> PathBuf {
        match (self.data_dir.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&self.data_dir),
        }
    }

    /// SQLite file holding the column store's partition keys
    pub fn column_store_path(&self) -> PathBuf {
        self.data_path().join("columnstore.db")
    }

    /// SQLite file holding one shard's partition key index
    pub fn index_path(&self, shard: &ShardRef) -> PathBuf {
        self.data_path()
            .join("index")
            .join(format!("{}-{}.db", shard.dataset, shard.shard))
    }
}

/// Bootstrap and refresh settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootstrapSettings {
    /// Records processed concurrently; defaults to available cores
    #[serde(default)]
    pub parallelism: Option<usize>,

    /// Retention window used to clamp downsample checkpoints
    #[serde(default = "default_ttl_hours")]
    pub downsample_ttl_hours: u64,

    #[serde(default = "default_schemas")]
    pub schemas: Vec<SchemaDefinition>,
}

fn default_ttl_hours() -> u64 {
    24 * 7 // one week
}

fn default_schemas() -> Vec<SchemaDefinition> {
    vec![
        SchemaDefinition {
            name: "gauge".to_string(),
            downsample: Some("ds-gauge".to_string()),
        },
        SchemaDefinition {
            name: "counter".to_string(),
            downsample: Some("ds-counter".to_string()),
        },
        SchemaDefinition {
            name: "untyped".to_string(),
            downsample: None,
        },
    ]
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            parallelism: None,
            downsample_ttl_hours: default_ttl_hours(),
            schemas: default_schemas(),
        }
    }
}

impl BootstrapSettings {
    pub fn ttl_ms(&self) -> i64 {
        (self.downsample_ttl_hours as i64).saturating_mul(MILLIS_PER_HOUR)
    }

    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            parallelism: self.parallelism.unwrap_or_else(default_parallelism).max(1),
        }
    }

    pub fn schema_set(&self) -> BootstrapResult<SchemaSet> {
        SchemaSet::from_definitions(&self.schemas)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chronicle-index").join("config.toml")),
            Some(PathBuf::from("/etc/chronicle-index/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Store overrides
        if let Some(data_dir) = lookup("CHRONICLE_INDEX_DATA_DIR") {
            self.store.data_dir = data_dir;
        }

        // Bootstrap overrides
        if let Some(parallelism) = lookup("CHRONICLE_INDEX_PARALLELISM") {
            match parallelism.parse() {
                Ok(p) => self.bootstrap.parallelism = Some(p),
                Err(_) => tracing::warn!(
                    value = %parallelism,
                    "Ignoring invalid CHRONICLE_INDEX_PARALLELISM"
                ),
            }
        }
        if let Some(ttl) = lookup("CHRONICLE_INDEX_TTL_HOURS") {
            match ttl.parse() {
                Ok(hours) => self.bootstrap.downsample_ttl_hours = hours,
                Err(_) => tracing::warn!(
                    value = %ttl,
                    "Ignoring invalid CHRONICLE_INDEX_TTL_HOURS"
                ),
            }
        }

        // Logging overrides
        if let Some(level) = lookup("CHRONICLE_INDEX_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CHRONICLE_INDEX_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# chronicle-index Configuration
#
# Environment variables override these settings:
# - CHRONICLE_INDEX_DATA_DIR
# - CHRONICLE_INDEX_PARALLELISM
# - CHRONICLE_INDEX_TTL_HOURS
# - CHRONICLE_INDEX_LOG_LEVEL
# - CHRONICLE_INDEX_LOG_FORMAT

[store]
# Directory holding the column store and the per-shard index files
data_dir = "~/.local/share/chronicle-index"

# Rows fetched per page when scanning partition keys
scan_batch_size = 4096

[bootstrap]
# Records indexed concurrently by the parallel paths
# (defaults to the number of available cores)
# parallelism = 8

# Downsample checkpoints never reach further back than this (hours)
downsample_ttl_hours = 168

# Raw schemas and the downsample schema their series map to.
# Omit `downsample` for schemas that are not downsampled.
[[bootstrap.schemas]]
name = "gauge"
downsample = "ds-gauge"

[[bootstrap.schemas]]
name = "counter"
downsample = "ds-counter"

[[bootstrap.schemas]]
name = "untyped"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/chronicle-index/chronicle-index.log"
"#
    .to_string()
}
