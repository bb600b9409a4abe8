//! Configuration management for the sync engine.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default change-feed URL (can be overridden at compile time via REALTIME_SYNC_DEFAULT_FEED_URL).
pub const DEFAULT_FEED_URL: &str = match option_env!("REALTIME_SYNC_DEFAULT_FEED_URL") {
    Some(url) => url,
    None => "ws://127.0.0.1:4000/changes",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Retry policy settings for change-feed subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any single retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Retries scheduled before a subscription is marked failed.
    pub max_attempts: u32,
    /// Fraction of the computed delay added as random jitter (0.0..=1.0).
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter_ratio: 0.3,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// WebSocket URL of the change feed.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,
    /// Overrides the cache directory (defaults to `<base>/cache`).
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// How long a subscribe handshake may take before it counts as a failure.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Keepalive interval for the WebSocket transport.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            cache_dir: None,
            reconnect: ReconnectConfig::default(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `<base>/config.json`, falling back to defaults.
    /// Environment variables are applied last.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("REALTIME_SYNC_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(feed_url) = std::env::var("REALTIME_SYNC_FEED_URL") {
            if !feed_url.trim().is_empty() {
                self.feed_url = feed_url.trim().to_string();
            }
        }
    }

    /// Reject settings that would make the retry policy unbounded or nonsensical.
    pub fn validate(&self) -> CoreResult<()> {
        if self.reconnect.max_attempts == 0 {
            return Err(CoreError::Config(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            return Err(CoreError::Config(format!(
                "reconnect.jitter_ratio must be within 0.0..=1.0, got {}",
                self.reconnect.jitter_ratio
            )));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(CoreError::Config(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the feed URL as a parsed URL.
    pub fn feed_url(&self) -> CoreResult<Url> {
        Url::parse(&self.feed_url).map_err(CoreError::from)
    }

    /// Cache directory, honouring the `cache_dir` override.
    pub fn cache_dir(&self, paths: &Paths) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| paths.cache_dir())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}
