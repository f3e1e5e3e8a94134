//! Configuration loading.
//!
//! Settings are loaded from TOML with the following resolution order:
//! 1. explicit path (passed by the embedding service)
//! 2. `~/.mimir/config.toml` (user)
//! 3. `/etc/mimir/config.toml` (system)
//!
//! Every field has a default, so a missing file or an empty table is valid.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::cache::CacheConfig;
use crate::watcher::BackoffConfig;
use crate::{MimirError, Result};

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub collections: CollectionSettings,
}

/// Snapshot freshness.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Snapshot time-to-live in seconds (default: 300).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Quiet period after a failed reload in milliseconds (default: 1000).
    #[serde(default = "default_reload_retry_interval_ms")]
    pub reload_retry_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            reload_retry_interval_ms: default_reload_retry_interval_ms(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_reload_retry_interval_ms() -> u64 {
    1000
}

/// Change-feed reconnect backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherSettings {
    /// First backoff delay in milliseconds (default: 5000).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff cap in seconds (default: 60).
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Growth factor (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Add jitter to reconnect delays (default: true).
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Seconds a quiet subscription must last before the failure count
    /// resets (default: 30).
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            stable_after_secs: default_stable_after_secs(),
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    5000
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_stable_after_secs() -> u64 {
    30
}

/// Startup and shutdown.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleSettings {
    /// Per-watcher stop timeout in seconds (default: 10).
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// Log verbosity.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset (default: "info").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Store collection names for the standard cache instances.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionSettings {
    #[serde(default = "default_source_configs")]
    pub source_configs: String,
    #[serde(default = "default_agent_configs")]
    pub agent_configs: String,
    #[serde(default = "default_prompts")]
    pub prompts: String,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            source_configs: default_source_configs(),
            agent_configs: default_agent_configs(),
            prompts: default_prompts(),
        }
    }
}

fn default_source_configs() -> String {
    "source_configs".to_string()
}

fn default_agent_configs() -> String {
    "agent_configs".to_string()
}

fn default_prompts() -> String {
    "prompts".to_string()
}

impl Settings {
    /// Load settings from the standard locations.
    ///
    /// An explicit path must exist. Without one, the first of
    /// `~/.mimir/config.toml` and `/etc/mimir/config.toml` that exists is
    /// used, and defaults apply if neither does.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse settings from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| MimirError::Configuration(format!("Failed to parse config: {e}")))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MimirError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let settings: Settings = toml::from_str(&content).map_err(|e| {
            MimirError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })?;
        debug!(path = %path.display(), "loaded config");
        Ok(settings)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(MimirError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mimir").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/mimir/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Engine config for every cache instance.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .ttl(Duration::from_secs(self.cache.ttl_secs))
            .reload_retry_interval(Duration::from_millis(self.cache.reload_retry_interval_ms))
    }

    /// Reconnect backoff for every watcher.
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig::new()
            .initial_delay(Duration::from_millis(self.watcher.initial_backoff_ms))
            .max_delay(Duration::from_secs(self.watcher.max_backoff_secs))
            .multiplier(self.watcher.multiplier)
            .jitter(self.watcher.jitter)
            .stable_after(Duration::from_secs(self.watcher.stable_after_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.shutdown_timeout_secs)
    }
}
