//! Configuration types for the tunnelwatch pipeline.
//!
//! Configuration determines how much history each channel keeps, how
//! subscribers are buffered, and how the connection controller retries a
//! lost feed. All durations serialize as floating-point seconds so configs
//! can be written by hand.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tunnelwatch::config::{PipelineConfig, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig {
//!     store: StoreConfig {
//!         max_readings: 1440,
//!         retention: Some(Duration::from_secs(86_400)),
//!         ..StoreConfig::default()
//!     },
//!     ..PipelineConfig::default()
//! };
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Upper bound on `max_readings` to catch misconfigured counts.
const MAX_READINGS_LIMIT: usize = 10_000_000;

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Series store bounds and subscriber buffering.
    pub store: StoreConfig,

    /// Reconnection policy for feed subscriptions.
    pub retry: RetryConfig,
}

impl PipelineConfig {
    /// Loads a configuration from a JSON file and validates it.
    ///
    /// Fields absent from the file take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON, or
    /// [`ConfigError::InvalidValue`] if validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates every section of the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

/// Bounds and buffering for the per-channel series store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of readings kept per channel.
    ///
    /// Inserting beyond this bound evicts the oldest reading.
    pub max_readings: usize,

    /// Maximum age of a reading relative to the newest reading of its
    /// channel, measured in source time.
    ///
    /// `None` keeps readings until `max_readings` evicts them.
    #[serde(with = "option_duration_serde")]
    pub retention: Option<Duration>,

    /// Channels with no insert for this long are removed by the idle sweeper.
    #[serde(with = "option_duration_serde")]
    pub idle_timeout: Option<Duration>,

    /// Number of updates buffered per channel for fan-out subscribers.
    ///
    /// A subscriber that falls further behind than this is dropped.
    pub subscriber_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_readings: 10_000,
            retention: None,
            idle_timeout: None,
            subscriber_buffer: 256,
        }
    }
}

impl StoreConfig {
    /// Validates the store configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a bound is zero or too large.
    pub fn validate(&self) -> Result<()> {
        if self.max_readings == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.max_readings",
                reason: "must be > 0".to_string(),
            }
            .into());
        }

        if self.max_readings > MAX_READINGS_LIMIT {
            return Err(ConfigError::InvalidValue {
                field: "store.max_readings",
                reason: format!("{} exceeds limit {MAX_READINGS_LIMIT}", self.max_readings),
            }
            .into());
        }

        if let Some(retention) = self.retention
            && retention.is_zero()
        {
            return Err(ConfigError::InvalidValue {
                field: "store.retention",
                reason: "cannot be zero".to_string(),
            }
            .into());
        }

        if let Some(idle) = self.idle_timeout
            && idle.is_zero()
        {
            return Err(ConfigError::InvalidValue {
                field: "store.idle_timeout",
                reason: "cannot be zero".to_string(),
            }
            .into());
        }

        if self.subscriber_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.subscriber_buffer",
                reason: "must be > 0".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Returns the retention window in milliseconds of source time, if set.
    #[allow(clippy::cast_possible_truncation)] // retention in ms fits in u64 for any sane config
    pub fn retention_ms(&self) -> Option<u64> {
        self.retention.map(|r| r.as_millis() as u64)
    }
}

/// Reconnection policy for a feed subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first reconnection attempt.
    #[serde(with = "duration_serde")]
    pub initial_backoff: Duration,

    /// Cap on the delay between attempts.
    #[serde(with = "duration_serde")]
    pub max_backoff: Duration,

    /// Fraction of the nominal delay added as random jitter, in `[0, 1]`.
    pub jitter: f64,

    /// Number of consecutive failed attempts before the channel fails.
    pub max_retries: u32,

    /// Treat a silent stream as lost after this long.
    ///
    /// Push feeds only emit on change, so this is off by default.
    #[serde(with = "option_duration_serde")]
    pub stall_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
            max_retries: 10,
            stall_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Validates the retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the delays are zero or
    /// inverted, or jitter is outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_backoff",
                reason: "cannot be zero".to_string(),
            }
            .into());
        }

        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff",
                reason: format!(
                    "max_backoff ({:?}) must be >= initial_backoff ({:?})",
                    self.max_backoff, self.initial_backoff
                ),
            }
            .into());
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidValue {
                field: "retry.jitter",
                reason: format!("{} is outside [0, 1]", self.jitter),
            }
            .into());
        }

        if let Some(stall) = self.stall_timeout
            && stall.is_zero()
        {
            return Err(ConfigError::InvalidValue {
                field: "retry.stall_timeout",
                reason: "cannot be zero".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

mod option_duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|seconds| Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom))
            .transpose()
    }
}
