//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use ttl_fcache::cache::limiter::{DEFAULT_FILE_READS, DEFAULT_GLOBAL_READS};
use ttl_fcache::directory::{
    DEFAULT_FILE_TTL, DEFAULT_MEMORY_TTL, DEFAULT_WRITE_STREAM_ERROR_TIMEOUT,
};
use ttl_fcache::stream::DEFAULT_CHUNK_SIZE;
use ttl_fcache::{CacheOptions, ReadLimiter};

fn default_cache_dir() -> PathBuf {
    if let Some(path) = dirs::cache_dir() {
        return path.join("ttl-fcache");
    }

    if let Some(path) = dirs::home_dir() {
        return path.join(".cache").join("ttl-fcache");
    }

    PathBuf::from("/tmp/ttl-fcache")
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "default durations are far below u64::MAX milliseconds"
)]
const fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// The cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// The path to the cache directory.
    pub path: PathBuf,

    /// Create the cache directory if it does not exist.
    pub create_if_missing: bool,

    /// Idle time, in milliseconds, after which a file's memory copy is dropped.
    pub memory_ttl_ms: u64,

    /// Idle time, in milliseconds, after which a cache file is deleted.
    pub file_ttl_ms: u64,

    /// Maximum number of concurrent reads against one file.
    pub max_file_reads: usize,

    /// Maximum number of concurrent reads across the whole cache.
    pub max_global_reads: usize,

    /// Time, in milliseconds, a failed write stream may hold on to its file.
    pub write_stream_error_timeout_ms: u64,

    /// Chunk size used by the `get` and `put` commands.
    pub chunk_size: ByteSize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_dir(),
            create_if_missing: true,
            memory_ttl_ms: millis(DEFAULT_MEMORY_TTL),
            file_ttl_ms: millis(DEFAULT_FILE_TTL),
            max_file_reads: DEFAULT_FILE_READS,
            max_global_reads: DEFAULT_GLOBAL_READS,
            write_stream_error_timeout_ms: millis(DEFAULT_WRITE_STREAM_ERROR_TIMEOUT),
            chunk_size: ByteSize::b(DEFAULT_CHUNK_SIZE as u64),
        }
    }
}

impl CacheConfig {
    /// Library options equivalent to this configuration.
    pub fn to_options(&self) -> CacheOptions {
        CacheOptions::default()
            .with_memory_ttl(Duration::from_millis(self.memory_ttl_ms))
            .with_file_ttl(Duration::from_millis(self.file_ttl_ms))
            .with_max_file_reads(self.max_file_reads)
            .with_write_stream_error_timeout(Duration::from_millis(
                self.write_stream_error_timeout_ms,
            ))
            .with_read_limiter(Arc::new(ReadLimiter::new(self.max_global_reads)))
    }

    /// The configured chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        usize::try_from(self.chunk_size.as_u64()).unwrap_or(usize::MAX)
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages if the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.cache.path.is_absolute() {
            errors.push(format!(
                "Cache path '{}' must be absolute.",
                self.cache.path.display()
            ));
        }
        if self.cache.memory_ttl_ms == 0 {
            errors.push("memory-ttl-ms must be greater than zero.".to_owned());
        }
        if self.cache.file_ttl_ms == 0 {
            errors.push("file-ttl-ms must be greater than zero.".to_owned());
        }
        if self.cache.max_file_reads == 0 {
            errors.push("max-file-reads must be greater than zero.".to_owned());
        }
        if self.cache.max_global_reads == 0 {
            errors.push("max-global-reads must be greater than zero.".to_owned());
        }
        if self.cache.chunk_size.as_u64() == 0 {
            errors.push("chunk-size must be greater than zero.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("ttl-fcache").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("ttl-fcache").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/ttl-fcache/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config, falling back to the defaults if no config file exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(res) = Self::load(external_config_path) else {
            debug!("No configuration file found; using defaults.");
            return Ok(Self::default());
        };

        let config = res?;
        if let Err(validation_errors) = config.validate() {
            return Err(ConfigError::ValidationErrors(validation_errors));
        }
        debug!("Loaded configuration successfully.");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap_or_else(|e| panic!("parse: {e}"));
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn kebab_case_keys_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            path = "/var/cache/demo"
            memory-ttl-ms = 250
            chunk-size = "4 KiB"
            "#,
        )
        .unwrap_or_else(|e| panic!("parse: {e}"));

        assert_eq!(config.cache.path, PathBuf::from("/var/cache/demo"));
        assert_eq!(config.cache.memory_ttl_ms, 250);
        assert_eq!(config.cache.chunk_size(), 4096);
        assert_eq!(config.cache.file_ttl_ms, millis(DEFAULT_FILE_TTL));
        assert!(config.cache.create_if_missing);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = Config::default();
        config.cache.path = PathBuf::from("relative");
        config.cache.file_ttl_ms = 0;
        config.cache.max_global_reads = 0;

        let errors = config.validate().err().unwrap_or_default();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }
}
