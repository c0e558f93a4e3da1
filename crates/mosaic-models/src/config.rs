//! Broker and session configuration.
//!
//! Loaded from TOML, by default from `~/.mosaic/config.toml`.

use mosaic_weights::ChannelOrder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cache::HashMode;
use crate::resource::CachePreset;

/// Per-session options, fixed when the session is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Drop encoder weights after every encode that ran the engine.
    #[serde(default)]
    pub release_encoders_after_encoding: bool,

    /// Capacity of each of the session's conditioning caches (default: 32).
    #[serde(default = "default_max_cached_embeddings")]
    pub max_cached_embeddings: usize,

    /// Compute-cache byte budget, overriding the broker's preset.
    #[serde(default)]
    pub compute_cache_limit: Option<u64>,

    /// How image bytes are fingerprinted for cache keys.
    #[serde(default)]
    pub hash_mode: HashMode,
}

fn default_max_cached_embeddings() -> usize {
    32
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            release_encoders_after_encoding: false,
            max_cached_embeddings: default_max_cached_embeddings(),
            compute_cache_limit: None,
            hash_mode: HashMode::default(),
        }
    }
}

impl SessionConfig {
    /// Validate the session configuration.
    ///
    /// # Errors
    /// Returns `BrokerConfigError::InvalidValue` if a value is out of range.
    pub fn validate(&self) -> BrokerConfigResult<()> {
        if self.max_cached_embeddings == 0 {
            return Err(BrokerConfigError::InvalidValue(
                "max_cached_embeddings must be greater than 0".to_string(),
            ));
        }
        if self.compute_cache_limit == Some(0) {
            return Err(BrokerConfigError::InvalidValue(
                "compute_cache_limit must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Broker-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Compute-cache preset applied to every loaded engine.
    #[serde(default)]
    pub resource_preset: CachePreset,

    /// Explicit compute-cache byte budget, overriding the preset.
    #[serde(default)]
    pub compute_cache_limit: Option<u64>,

    /// Convolution kernel layout expected by the engine.
    #[serde(default)]
    pub channel_order: ChannelOrder,

    /// Defaults for sessions created without an explicit configuration.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum BrokerConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read or write the configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse the configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type BrokerConfigResult<T> = std::result::Result<T, BrokerConfigError>;

impl BrokerConfig {
    /// Validate the broker configuration and its session defaults.
    ///
    /// # Errors
    /// Returns `BrokerConfigError::InvalidValue` if a value is out of range.
    pub fn validate(&self) -> BrokerConfigResult<()> {
        if self.compute_cache_limit == Some(0) {
            return Err(BrokerConfigError::InvalidValue(
                "compute_cache_limit must be greater than 0".to_string(),
            ));
        }
        self.session.validate()
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file is missing, unreadable, malformed or invalid.
    pub fn load_from_file(path: &Path) -> BrokerConfigResult<Self> {
        if !path.exists() {
            return Err(BrokerConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerConfigError::ReadError(format!("{}: {e}", path.display())))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| BrokerConfigError::ParseError(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &Path) -> BrokerConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BrokerConfigError::ParseError(format!("Failed to serialize: {e}")))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BrokerConfigError::ReadError(format!("Failed to create directory: {e}"))
            })?;
        }

        std::fs::write(path, content)
            .map_err(|e| BrokerConfigError::ReadError(format!("Failed to write file: {e}")))?;

        Ok(())
    }

    /// Default global configuration file path.
    #[must_use]
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map_or_else(|_| PathBuf::from("."), PathBuf::from)
            .join(".mosaic")
            .join("config.toml")
    }
}
