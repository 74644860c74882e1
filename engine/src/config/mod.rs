//! Configuration management
//!
//! This module handles loading, validation, and management of the flowbot
//! configuration. Configuration is stored in TOML format at ~/.flowbot/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **vault**: Where the credential vault key comes from
//! - **engine**: Session transition limits and request defaults
//! - **scheduler**: Emitter dedup window, sync interval, timezone and jitter cap
//! - **http**: Shared outbound client settings
//!
//! # Vault key
//!
//! The vault key is read exactly once, by [`Config::load_vault_key`], when
//! the process starts. A missing or malformed key aborts startup; the key
//! is never written back to disk by this module.
//!
//! # Examples
//!
//! ```no_run
//! use flowbot_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! let key = config.load_vault_key()?;
//! println!("Database: {:?}", config.database_path());
//! # Ok(())
//! # }
//! ```

use crate::crypto::VaultKey;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Credential vault key source
    #[serde(default)]
    pub vault: VaultConfig,

    /// Session machine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Emitter scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Outbound HTTP settings
    #[serde(default)]
    pub http: HttpConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Vault key source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Hex-encoded 32-byte key. Prefer `key_env` outside development.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Environment variable holding the hex-encoded key
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_env: default_key_env(),
        }
    }
}

/// Session machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on automatic hops (conditional, request, proxy) per transition
    #[serde(default = "default_max_hops")]
    pub max_hops_per_transition: usize,

    /// Timeout for request steps that declare none
    #[serde(default = "default_request_timeout")]
    pub default_request_timeout_secs: u64,

    /// Re-enter at the bot's start step when a message arrives at a dead end
    #[serde(default = "default_true")]
    pub start_step_reentry: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hops_per_transition: default_max_hops(),
            default_request_timeout_secs: default_request_timeout(),
            start_step_reentry: true,
        }
    }
}

/// Emitter scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long a fire execution id is remembered for deduplication
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,

    /// Interval between emitter/job reconciliation passes
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Timezone for recurrences that declare none
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Cap applied to any recurrence's jitter bound
    #[serde(default = "default_max_jitter")]
    pub max_jitter_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window(),
            sync_interval_secs: default_sync_interval(),
            default_timezone: default_timezone(),
            max_jitter_secs: default_max_jitter(),
        }
    }
}

/// Shared outbound HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Idle connections kept per host in the shared pool
    #[serde(default = "default_pool_idle")]
    pub pool_max_idle_per_host: usize,

    /// TCP connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// User-Agent header sent on every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_idle(),
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.flowbot")
}

fn default_key_env() -> String {
    "FLOWBOT_VAULT_KEY".to_string()
}

fn default_max_hops() -> usize {
    64
}

fn default_request_timeout() -> u64 {
    30
}

fn default_dedup_window() -> u64 {
    600
}

fn default_sync_interval() -> u64 {
    180
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_max_jitter() -> u64 {
    3600
}

fn default_pool_idle() -> usize {
    20
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("flowbot/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Load configuration from the default location (~/.flowbot/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// and saves it to the default location.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.flowbot/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".flowbot").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            vault: VaultConfig::default(),
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            http: HttpConfig::default(),
        }
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("flowbot.db")
    }

    /// Resolve the vault key from the inline value or the environment.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` when no key is configured or the key is
    /// malformed. Callers treat this as fatal at startup.
    pub fn load_vault_key(&self) -> Result<VaultKey, EngineError> {
        if let Some(inline) = self.vault.key.as_deref() {
            return VaultKey::from_hex(inline);
        }

        match std::env::var(&self.vault.key_env) {
            Ok(value) if !value.trim().is_empty() => VaultKey::from_hex(&value),
            _ => Err(EngineError::Config(format!(
                "vault key missing: set [vault].key or the {} environment variable",
                self.vault.key_env
            ))),
        }
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level and numeric bounds
    /// - Validates the default timezone
    /// - Expands ~ in the data directory and creates it
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.engine.max_hops_per_transition == 0 {
            return Err(EngineError::Config(
                "max_hops_per_transition must be at least 1".to_string(),
            ));
        }

        if self.engine.default_request_timeout_secs == 0 {
            return Err(EngineError::Config(
                "default_request_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.scheduler.dedup_window_secs == 0 {
            return Err(EngineError::Config(
                "dedup_window_secs must be at least 1".to_string(),
            ));
        }

        if self.scheduler.sync_interval_secs == 0 {
            return Err(EngineError::Config(
                "sync_interval_secs must be at least 1".to_string(),
            ));
        }

        if self
            .scheduler
            .default_timezone
            .parse::<chrono_tz::Tz>()
            .is_err()
        {
            return Err(EngineError::Config(format!(
                "Unknown timezone '{}'",
                self.scheduler.default_timezone
            )));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.engine.max_hops_per_transition, 64);
        assert_eq!(config.scheduler.sync_interval_secs, 180);
        assert_eq!(config.vault.key_env, "FLOWBOT_VAULT_KEY");
        assert!(config.engine.start_step_reentry);
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_inline_vault_key() {
        let mut config = Config::default_config();
        config.vault.key = Some("11".repeat(32));
        assert!(config.load_vault_key().is_ok());

        config.vault.key = Some("not-hex".to_string());
        assert!(matches!(
            config.load_vault_key(),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_missing_vault_key_is_config_error() {
        let mut config = Config::default_config();
        config.vault.key_env = "FLOWBOT_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        let err = config.load_vault_key().unwrap_err();
        assert!(err.to_string().contains("vault key missing"));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(
            config.scheduler.default_timezone,
            deserialized.scheduler.default_timezone
        );
        assert!(!toml_string.contains("key ="));
    }
}
