//! Runtime configuration.
//!
//! Every field has a default, so an empty document is a valid
//! configuration:
//!
//! ```toml
//! [cache]
//! idle_ttl_ms = 60000
//! pending_ttl_ms = 60000
//! capacity = 20
//!
//! [loader]
//! worker_threads = 2
//! default_layer_count = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors from loading or validating a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Two-tier model cache parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time without access after which an active entry becomes pending release.
    pub idle_ttl_ms: u64,
    /// Time in pending release after which an entry is disposed.
    pub pending_ttl_ms: u64,
    /// Maximum number of entries across both tiers before idle entries are
    /// evicted least-recently-used first.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl_ms: 60_000,
            pending_ttl_ms: 60_000,
            capacity: 20,
        }
    }
}

impl CacheConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }

    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }
}

/// Model loader parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Background threads running the first load phase.
    pub worker_threads: usize,
    /// Animation layer count used when a load request names none.
    pub default_layer_count: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            default_layer_count: 3,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        log::info!("Loaded runtime configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be at least 1".into()));
        }
        if self.loader.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "loader.worker_threads must be at least 1".into(),
            ));
        }
        if self.loader.default_layer_count == 0 {
            return Err(ConfigError::Invalid(
                "loader.default_layer_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
