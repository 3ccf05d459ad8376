//! Treelink configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::ControlPolicy;
use crate::discovery::{self, RetryPolicy};

/// Topology description used to build the transport tree
pub const ENV_TOPOLOGY_FILE: &str = "TREELINK_TOPOLOGY_FILE";
/// Number of independently launched workers the coordinator waits for
pub const ENV_NUM_WORKERS: &str = "TREELINK_NUM_WORKERS";
/// Discovery store shared by the coordinator and remote workers
pub const ENV_CONNECTIONS_FILE: &str = "TREELINK_CONNECTIONS_FILE";
/// Colon-separated directories searched for filter shared objects
pub const ENV_FILTER_PATH: &str = "TREELINK_FILTER_PATH";

/// Main treelink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Discovery store polling
    pub discovery: DiscoveryConfig,

    /// Waiting for workers to attach
    #[serde(rename = "bring-up")]
    pub bring_up: BringUpConfig,

    /// Control channel behavior
    pub control: ControlConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .treelink.yml
        let local_config = PathBuf::from(".treelink.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/treelink/treelink.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("treelink").join("treelink.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Log level from the config file, read before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".treelink.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("treelink").join("treelink.yml"));
                }
                paths
            }
        };
        candidates
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| Self::load_from_file(p).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Discovery store polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Attempts before a worker gives up looking for its rank
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Seconds between attempts
    #[serde(rename = "idle-secs")]
    pub idle_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: discovery::DEFAULT_MAX_RETRIES,
            idle_secs: discovery::DEFAULT_IDLE.as_secs(),
        }
    }
}

impl DiscoveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            idle: Duration::from_secs(self.idle_secs),
        }
    }
}

/// Waiting for independently launched workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BringUpConfig {
    /// Polls of the attached-worker counter before giving up
    #[serde(rename = "max-attach-retries")]
    pub max_attach_retries: u32,

    /// Milliseconds between polls
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
}

impl Default for BringUpConfig {
    fn default() -> Self {
        Self {
            max_attach_retries: 300,
            poll_interval_ms: 1000,
        }
    }
}

impl BringUpConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Control channel behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// blocking (summed, wait for all) or non-blocking (one reply per worker)
    pub policy: ControlPolicy,
}

/// Errors reading the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not defined")]
    MissingVariable(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    InvalidVariable { name: &'static str, value: String },
}

/// What a coordinator needs to bring up remote workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFrontSettings {
    pub topology_file: PathBuf,
    pub num_workers: u32,
    pub connections_file: PathBuf,
}

/// Settings taken from `TREELINK_*` environment variables
pub struct Environment {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

impl Environment {
    /// Read from the process environment
    pub fn from_process() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Read through an arbitrary lookup
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn get(&self, name: &'static str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn require(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::MissingVariable(name))
    }

    pub fn topology_file(&self) -> Result<PathBuf, ConfigError> {
        self.require(ENV_TOPOLOGY_FILE).map(PathBuf::from)
    }

    pub fn num_workers(&self) -> Result<u32, ConfigError> {
        let value = self.require(ENV_NUM_WORKERS)?;
        value
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidVariable {
                name: ENV_NUM_WORKERS,
                value,
            })
    }

    pub fn connections_file(&self) -> Result<PathBuf, ConfigError> {
        self.require(ENV_CONNECTIONS_FILE).map(PathBuf::from)
    }

    /// Optional filter search path
    pub fn filter_path(&self) -> Option<String> {
        self.get(ENV_FILTER_PATH)
    }

    /// Everything a coordinator needs for remote bring-up, checked in order
    pub fn remote_front(&self) -> Result<RemoteFrontSettings, ConfigError> {
        Ok(RemoteFrontSettings {
            topology_file: self.topology_file()?,
            num_workers: self.num_workers()?,
            connections_file: self.connections_file()?,
        })
    }
}
