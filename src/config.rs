//! Configuration management for riptide
//!
//! Handles loading and saving configuration from ~/.config/riptide/config.toml.
//! Every section falls back to defaults, so a missing or partial file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config and data directories
const APP_NAME: &str = "riptide";

/// Default share duration in hours
pub const DEFAULT_SHARE_HOURS: i64 = 24;

/// Longest allowed share, one year
pub const MAX_SHARE_HOURS: i64 = 8760;

/// Largest file accepted for sharing, 2 GiB
pub const DEFAULT_SIZE_LIMIT_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSettings,
    pub distribution: DistributionSettings,
    pub shares: ShareSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Command interface settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    /// Unix socket the cli connects to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_path: Option<PathBuf>,

    /// How long a cli connection may stay silent before it is dropped
    pub request_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            pid_path: None,
            request_timeout_secs: 30,
        }
    }
}

impl AgentSettings {
    pub fn effective_socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("agent.sock"))
    }

    pub fn effective_pid_path(&self) -> PathBuf {
        self.pid_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("agent.pid"))
    }
}

/// Distribution endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistributionSettings {
    /// Address the HTTP listener binds to
    pub bind: String,

    /// Base URL fetchers use to reach the listener
    pub public_url: String,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            public_url: "http://localhost:8080".to_string(),
        }
    }
}

/// How shared bytes are held while a share is active
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Serve the original file in place
    #[default]
    Reference,
    /// Copy the file into the agent's data directory at share time
    Copy,
}

/// Share lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShareSettings {
    pub default_hours: i64,
    pub max_hours: i64,
    pub size_limit_bytes: u64,
    /// Interval between expiry sweeps
    pub sweep_interval_secs: u64,
    pub storage: StorageMode,
    /// Where copies live when `storage = "copy"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_dir: Option<PathBuf>,
}

impl Default for ShareSettings {
    fn default() -> Self {
        Self {
            default_hours: DEFAULT_SHARE_HOURS,
            max_hours: MAX_SHARE_HOURS,
            size_limit_bytes: DEFAULT_SIZE_LIMIT_BYTES,
            sweep_interval_secs: 60,
            storage: StorageMode::Reference,
            copy_dir: None,
        }
    }
}

impl ShareSettings {
    pub fn effective_copy_dir(&self) -> PathBuf {
        self.copy_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("files"))
    }
}

/// Store backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Share store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreSettings {
    pub fn effective_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("shares.db"))
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoggingSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Create a configuration with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/riptide/config.toml on Linux
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Get the config directory path
    pub fn config_dir() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME))
    }

    /// Load configuration from the default location
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a file
    ///
    /// Returns default config if the file doesn't exist
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a file, creating its directory if needed
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Overwrite the file at `path` with the default configuration
    pub fn reset_to_defaults(path: &Path) -> ConfigResult<Self> {
        let config = Self::default();
        config.save_to(path)?;
        Ok(config)
    }

    /// Duration used when the cli doesn't pass `--time`
    pub fn effective_hours(&self, cli_hours: Option<i64>) -> i64 {
        cli_hours.unwrap_or(self.shares.default_hours)
    }
}

/// Directory holding the agent's socket, pid file, store and copies
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}
