//! Engine configuration.
//!
//! Every section has production defaults and a `for_testing()` variant
//! with short timers. The whole tree can be loaded from TOML; missing
//! keys keep their defaults:
//!
//! ```toml
//! [save]
//! quiet_period_ms = 1500
//! concurrency = "last_write_wins"
//!
//! [queue]
//! path = "/var/lib/backline/queue"
//! max_entries = 100
//!
//! [reconnect]
//! max_retries = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// How the save executor talks to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Plain update; conflicts are detected asynchronously.
    #[default]
    LastWriteWins,
    /// Update only when the stored version equals the expected one.
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    /// Debounce window after the last edit before a save is issued.
    pub quiet_period_ms: u64,
    pub concurrency: ConcurrencyMode,
    /// Autosave enabled when the session starts.
    pub enabled: bool,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 1500,
            concurrency: ConcurrencyMode::LastWriteWins,
            enabled: true,
        }
    }
}

impl SaveConfig {
    pub fn for_testing() -> Self {
        Self {
            quiet_period_ms: 50,
            ..Self::default()
        }
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// RocksDB directory.
    pub path: PathBuf,
    /// Oldest entries are evicted beyond this count.
    pub max_entries: usize,
    /// Entries older than this are pruned.
    pub max_age_ms: u64,
    /// fsync every write (default: false)
    pub sync_writes: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("backline_queue"),
            max_entries: 100,
            max_age_ms: 24 * 60 * 60 * 1000,
            sync_writes: false,
        }
    }
}

impl QueueConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_entries: 10,
            ..Self::default()
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before attempt n is `base_delay × 2^(n-1)`.
    pub base_delay_ms: u64,
    /// Extra random delay as a fraction of the computed delay (0.0 = none).
    pub jitter: f64,
    /// Read the store before each retry and raise conflicts instead of
    /// overwriting newer values.
    pub conflict_check: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            jitter: 0.0,
            conflict_check: true,
        }
    }
}

impl RetryConfig {
    pub fn for_testing() -> Self {
        Self {
            base_delay_ms: 10,
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts before the channel goes to `error`.
    pub max_retries: u32,
    /// Upper bound of random extra delay, as a fraction of the base delay.
    pub jitter: f64,
    /// A subscribe that does not confirm within this window counts as a
    /// channel error.
    pub subscribe_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_retries: 10,
            jitter: 0.3,
            subscribe_timeout_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    pub fn for_testing() -> Self {
        Self {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            max_retries: 3,
            jitter: 0.3,
            subscribe_timeout_ms: 500,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// At most one presence update per interval.
    pub throttle_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Peers silent for longer than this drop out of the roster view.
    pub idle_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 100,
            heartbeat_interval_ms: 15_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            throttle_ms: 20,
            heartbeat_interval_ms: 200,
            idle_timeout_ms: 1_000,
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Messages buffered per subscriber before lagging ones drop.
    pub capacity: usize,
    /// Size of the per-handle event queue.
    pub event_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub save: SaveConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub reconnect: ReconnectConfig,
    pub presence: PresenceConfig,
    pub channel: ChannelConfig,
}

impl CollabConfig {
    /// Short timers everywhere, queue under `queue_path`.
    pub fn for_testing(queue_path: impl Into<PathBuf>) -> Self {
        Self {
            save: SaveConfig::for_testing(),
            queue: QueueConfig::for_testing(queue_path),
            retry: RetryConfig::for_testing(),
            reconnect: ReconnectConfig::for_testing(),
            presence: PresenceConfig::for_testing(),
            channel: ChannelConfig::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CollabConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_entries == 0 {
            return Err(ConfigError::Invalid {
                key: "queue.max_entries",
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "retry.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        for (key, jitter) in [
            ("retry.jitter", self.retry.jitter),
            ("reconnect.jitter", self.reconnect.jitter),
        ] {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{jitter} is outside 0.0..=1.0"),
                });
            }
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid {
                key: "reconnect.initial_delay_ms",
                reason: "greater than reconnect.max_delay_ms".into(),
            });
        }
        if self.channel.capacity == 0 || self.channel.event_buffer == 0 {
            return Err(ConfigError::Invalid {
                key: "channel",
                reason: "buffers must be non-empty".into(),
            });
        }
        Ok(())
    }
}
