//! Resolved synchronization configuration.
//!
//! Peripherals (CLI parsing, config templating) hand the core a fully
//! resolved configuration; this module only validates it and offers a TOML
//! loader for callers that keep it in a file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Largest number of items coalesced into one range fetch.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Quiet period a checkpoint must survive unmodified before upload.
pub const DEFAULT_STABILITY_WINDOW_SECS: u64 = 10;
/// Watcher poll cadence.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("server address '{0}' is not an http url")]
    InvalidServer(String),
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
}

/// Trainer-side configuration for one sync session.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Data host base address, e.g. `http://192.168.1.3:8086`.
    pub server: String,
    /// Local mirror of the host's dataset directory.
    pub dataset_dir: PathBuf,
    /// Local directory receiving checkpoints; also the watcher's input.
    pub weights_dir: PathBuf,
    /// Chart file watched alongside the weights directory.
    #[serde(default)]
    pub chart_path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_stability_window_secs")]
    pub stability_window_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_stability_window_secs() -> u64 {
    DEFAULT_STABILITY_WINDOW_SECS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl SyncConfig {
    /// Build a config with defaults for everything beyond the addresses.
    pub fn new(
        server: impl Into<String>,
        dataset_dir: impl Into<PathBuf>,
        weights_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server: server.into(),
            dataset_dir: dataset_dir.into(),
            weights_dir: weights_dir.into(),
            chart_path: None,
            batch_size: DEFAULT_BATCH_SIZE,
            stability_window_secs: DEFAULT_STABILITY_WINDOW_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }

    /// Load and validate a config from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the sync components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.starts_with("http") {
            return Err(ConfigError::InvalidServer(self.server.clone()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_secs(self.stability_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
