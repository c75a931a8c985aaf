use crate::error::{Result, SettleError};
use crate::flight::OverlapPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub debounce: DebounceConfig,
    pub stage: StageConfig,
}

/// Debounced store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebounceConfig {
    /// Signed so that a negative value in the file is reported, not wrapped.
    pub quiet_period_ms: i64,
    pub poll_interval_ms: u64,
    pub channel_capacity: usize,
}

/// Single-flight stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StageConfig {
    pub overlap: OverlapPolicy,
    pub timeout_ms: Option<u64>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: crate::defaults::QUIET_PERIOD_MS,
            poll_interval_ms: crate::defaults::POLL_INTERVAL_MS,
            channel_capacity: crate::defaults::CHANNEL_CAPACITY,
        }
    }
}

impl DebounceConfig {
    /// The quiet period as a [`Duration`].
    ///
    /// Fails for negative values and for values above
    /// [`MAX_QUIET_PERIOD_MS`](crate::defaults::MAX_QUIET_PERIOD_MS).
    pub fn quiet_period(&self) -> Result<Duration> {
        let ms = self.quiet_period_ms;
        if ms < 0 {
            return Err(SettleError::ConfigInvalidValue {
                key: "debounce.quiet_period_ms".to_string(),
                message: format!("{ms} is negative"),
            });
        }
        if ms > crate::defaults::MAX_QUIET_PERIOD_MS {
            return Err(SettleError::ConfigInvalidValue {
                key: "debounce.quiet_period_ms".to_string(),
                message: format!(
                    "{ms} exceeds the maximum of {}",
                    crate::defaults::MAX_QUIET_PERIOD_MS
                ),
            });
        }
        Ok(Duration::from_millis(ms.unsigned_abs()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl StageConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file is missing or contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SettleError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                SettleError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(SettleError::ConfigFileNotFound { .. }) => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - SETTLE_QUIET_PERIOD_MS → debounce.quiet_period_ms
    /// - SETTLE_STAGE_TIMEOUT_MS → stage.timeout_ms
    /// - SETTLE_OVERLAP → stage.overlap
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var("SETTLE_QUIET_PERIOD_MS")
            && !value.is_empty()
        {
            self.debounce.quiet_period_ms =
                value
                    .trim()
                    .parse()
                    .map_err(|_| SettleError::ConfigInvalidValue {
                        key: "SETTLE_QUIET_PERIOD_MS".to_string(),
                        message: format!("'{value}' is not a number of milliseconds"),
                    })?;
        }

        if let Ok(value) = std::env::var("SETTLE_STAGE_TIMEOUT_MS")
            && !value.is_empty()
        {
            let ms: u64 = value
                .trim()
                .parse()
                .map_err(|_| SettleError::ConfigInvalidValue {
                    key: "SETTLE_STAGE_TIMEOUT_MS".to_string(),
                    message: format!("'{value}' is not a number of milliseconds"),
                })?;
            // 0 disables the timeout.
            self.stage.timeout_ms = (ms > 0).then_some(ms);
        }

        if let Ok(value) = std::env::var("SETTLE_OVERLAP")
            && !value.is_empty()
        {
            self.stage.overlap =
                value
                    .parse()
                    .map_err(|message| SettleError::ConfigInvalidValue {
                        key: "SETTLE_OVERLAP".to_string(),
                        message,
                    })?;
        }

        Ok(self)
    }

    /// Checks every value that can only be rejected at runtime.
    pub fn validate(&self) -> Result<()> {
        self.debounce.quiet_period()?;
        if self.debounce.channel_capacity == 0 {
            return Err(SettleError::ConfigInvalidValue {
                key: "debounce.channel_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.stage.timeout_ms == Some(0) {
            return Err(SettleError::ConfigInvalidValue {
                key: "stage.timeout_ms".to_string(),
                message: "must be positive; omit it to disable the timeout".to_string(),
            });
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/settle/config.toml on Linux, or `None` when the
    /// platform has no config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("settle").join("config.toml"))
    }
}
