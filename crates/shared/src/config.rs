//! Configuration management for the comic API client.
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory settings
    pub data: DataConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Remote API settings
    pub api: ApiConfig,

    /// Client-side rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root data directory path
    pub root_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log directory path (relative to data directory or absolute)
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL every request path is appended to
    pub base_url: String,

    /// Per-request transport timeout in milliseconds
    pub timeout_ms: u64,

    /// Retries after the first attempt
    pub retries: u32,

    /// Base delay for exponential backoff in milliseconds
    pub retry_delay_ms: u64,

    /// Share one network call between identical concurrent requests
    pub enable_deduplication: bool,

    /// Gate outbound calls through the client-side rate limiter
    pub enable_rate_limit: bool,
}

/// A single sliding-window limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Requests admitted per window
    pub max_requests: u32,

    /// Window length in milliseconds
    pub window_ms: u64,
}

/// Limit applied to endpoints containing `pattern`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Substring matched against the request's endpoint pattern
    pub pattern: String,

    /// Requests admitted per window
    pub max_requests: u32,

    /// Window length in milliseconds
    pub window_ms: u64,
}

impl EndpointRule {
    pub fn limit(&self) -> LimitRule {
        LimitRule {
            max_requests: self.max_requests,
            window_ms: self.window_ms,
        }
    }
}

/// Rate limiting configuration
///
/// Endpoint rules are checked in order; the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Limit for endpoints no rule matches
    pub default: LimitRule,

    /// Ordered endpoint-specific rules
    #[serde(default)]
    pub endpoints: Vec<EndpointRule>,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable caching
    pub enabled: bool,

    /// Maximum entries held in the memory tier
    pub memory_capacity: usize,

    /// TTL used when a caller does not pass one
    pub default_ttl_secs: u64,

    /// Prefix namespacing cache keys inside the persistent store
    pub key_prefix: String,

    /// SQLite store path (relative to data directory or absolute)
    pub store_path: String,

    /// Byte quota for the persistent store (None = unbounded)
    pub quota_bytes: Option<u64>,

    /// Interval between periodic cleanup passes
    pub cleanup_interval_secs: u64,

    /// Chance that a cleanup pass also sweeps the persistent tier
    pub persistent_sweep_probability: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let rule = |pattern: &str, max_requests, window_ms| EndpointRule {
            pattern: pattern.to_string(),
            max_requests,
            window_ms,
        };

        Self {
            default: LimitRule {
                max_requests: 60,
                window_ms: 60_000,
            },
            endpoints: vec![
                rule("search", 10, 10_000),
                rule("read", 30, 60_000),
                rule("detail", 30, 60_000),
            ],
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: 50,
            default_ttl_secs: 300,
            key_prefix: "comic_cache_".to_string(),
            store_path: "cache.db".to_string(),
            quota_bytes: Some(5 * 1024 * 1024),
            cleanup_interval_secs: 300,
            persistent_sweep_probability: 0.1,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                root_dir: "data".to_string(),
            },
            logging: LoggingConfig {
                log_dir: "logs".to_string(),
                default_level: "info".to_string(),
                console: true,
                file: true,
                json_format: false,
            },
            api: ApiConfig {
                base_url: "https://api.komiku.example/api".to_string(),
                timeout_ms: 15_000,
                retries: 3,
                retry_delay_ms: 1000,
                enable_deduplication: true,
                enable_rate_limit: true,
            },
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration saved successfully"
        );

        Ok(())
    }

    /// Get the absolute path for the data directory
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.root_dir)
    }

    /// Get the absolute path for the log directory
    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.logging.log_dir)
    }

    /// Get the absolute path for the persistent cache store
    pub fn store_path(&self) -> PathBuf {
        self.resolve(&self.cache.store_path)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data.root_dir, "data");
        assert_eq!(config.api.retries, 3);
        assert_eq!(config.cache.memory_capacity, 50);
        assert_eq!(config.rate_limit.endpoints[0].pattern, "search");
    }

    #[test]
    fn test_save_and_load_config() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");

        let original_config = Config::default();
        original_config.save(&config_path)?;

        assert!(config_path.exists());

        let loaded_config = Config::from_file(&config_path)?;
        assert_eq!(loaded_config.data.root_dir, original_config.data.root_dir);
        assert_eq!(loaded_config.api.base_url, original_config.api.base_url);
        assert_eq!(
            loaded_config.rate_limit.endpoints,
            original_config.rate_limit.endpoints
        );

        Ok(())
    }

    #[test]
    fn test_partial_config_uses_section_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[data]
root_dir = "/tmp/comics"

[logging]
log_dir = "logs"
default_level = "debug"
console = true
file = false
json_format = false

[api]
base_url = "http://localhost:3000"
timeout_ms = 5000
retries = 1
retry_delay_ms = 200
enable_deduplication = true
enable_rate_limit = false
"#,
        )?;

        let config = Config::from_file(&config_path)?;
        assert_eq!(config.api.retries, 1);
        assert!(!config.api.enable_rate_limit);
        assert_eq!(config.cache.key_prefix, "comic_cache_");
        assert_eq!(config.rate_limit.default.max_requests, 60);

        Ok(())
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        assert_eq!(config.data.root_dir, "data");
    }

    #[test]
    fn test_path_resolution() {
        let config = Config::default();

        let log_dir = config.log_dir();
        assert!(log_dir.ends_with("data/logs"));

        let store_path = config.store_path();
        assert!(store_path.ends_with("data/cache.db"));
    }
}
