//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/vidqa/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/vidqa/` (~/.config/vidqa/)
//! - Data: `$XDG_DATA_HOME/vidqa/` (~/.local/share/vidqa/)
//! - State/Logs: `$XDG_STATE_HOME/vidqa/` (~/.local/state/vidqa/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Indexing/answering service
    #[serde(default)]
    pub service: ServiceConfig,

    /// Poll intervals for the background loops
    #[serde(default)]
    pub polling: PollingConfig,

    /// Ingest request de-duplication
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote service configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Base URL of the service (e.g., `http://localhost:8000`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_service_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_service_timeout() -> u64 {
    60
}

/// Poll intervals
#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    /// Location fallback poll, in milliseconds
    #[serde(default = "default_location_interval")]
    pub location_interval_ms: u64,

    /// Indexing status poll while a video is indexing, in milliseconds
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            location_interval_ms: default_location_interval(),
            status_interval_ms: default_status_interval(),
        }
    }
}

impl PollingConfig {
    pub fn location_interval(&self) -> Duration {
        Duration::from_millis(self.location_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

fn default_location_interval() -> u64 {
    1000
}

fn default_status_interval() -> u64 {
    2000
}

/// Ingest de-duplication settings
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Seconds a persisted ingest claim keeps blocking repeat requests
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: default_claim_ttl(),
        }
    }
}

impl IngestConfig {
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

fn default_claim_ttl() -> u64 {
    24 * 60 * 60
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let base = &self.service.base_url;
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(Error::Config(format!(
                "service.base_url must be an http(s) URL, got {:?}",
                base
            )));
        }
        if self.service.timeout_secs == 0 {
            return Err(Error::Config(
                "service.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.polling.location_interval_ms == 0 || self.polling.status_interval_ms == 0 {
            return Err(Error::Config(
                "polling intervals must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/vidqa/config.toml` (~/.config/vidqa/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("vidqa").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/vidqa/` (~/.local/share/vidqa/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("vidqa")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/vidqa/` (~/.local/state/vidqa/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("vidqa")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/vidqa/state.db` (~/.local/share/vidqa/state.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("state.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/vidqa/vidqa.log` (~/.local/state/vidqa/vidqa.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("vidqa.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
