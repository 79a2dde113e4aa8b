//! Declarative configuration for a telemetry store.
//!
//! Per-key buffer settings live in a table validated once at startup, so
//! "configure this key" can never race with "this key's buffer was already
//! created". The same file carries poll and gateway settings.
//!
//! # Example
//!
//! ```json
//! {
//!   "default_buffer": { "capacity": 20000 },
//!   "buffers": {
//!     "led_state": { "capacity": 10000 },
//!     "hd": { "capacity": 20000, "eviction": { "max_age": { "max_age_ms": 30000 } } }
//!   },
//!   "poll": {
//!     "outstanding_timeout_ms": 1000,
//!     "subscriptions": [ { "keys": ["led_state"], "interval_ms": 50 } ]
//!   },
//!   "gateway": { "query_timeout_ms": 2000 }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{DEFAULT_CAPACITY, EvictionPolicy, TimeSeriesBuffer};
use crate::error::{ConfigError, Result};
use crate::poll::PollSpec;
use crate::sample::Key;

/// Default requester-side deadline for remote queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Default age after which an unanswered poll request is considered lost.
pub const DEFAULT_OUTSTANDING_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Capacity and eviction settings for one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// Maximum number of retained samples.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// How old samples are discarded.
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            eviction: EvictionPolicy::Fifo,
        }
    }
}

impl BufferConfig {
    /// Creates a validated buffer configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the capacity is zero or a max-age window
    /// of zero is requested.
    pub fn new(capacity: usize, eviction: EvictionPolicy) -> Result<Self> {
        let config = Self { capacity, eviction };
        config.validate("buffer")?;
        Ok(config)
    }

    /// Validates this configuration. `scope` names it in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCapacity`] or
    /// [`ConfigError::InvalidMaxAge`].
    pub fn validate(&self, scope: &str) -> Result<()> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity {
                scope: scope.to_string(),
                capacity: self.capacity,
            }
            .into());
        }

        if let EvictionPolicy::MaxAge { max_age_ms: 0 } = self.eviction {
            return Err(ConfigError::InvalidMaxAge {
                scope: scope.to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Constructs an empty buffer with these settings.
    pub fn build(&self) -> TimeSeriesBuffer {
        TimeSeriesBuffer::with_policy(self.capacity, self.eviction)
    }
}

/// Poll scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    /// How long a poll request may stay unanswered before the next tick
    /// issues a fresh one instead of coalescing into it.
    #[serde(
        rename = "outstanding_timeout_ms",
        with = "duration_ms",
        default = "default_outstanding_timeout"
    )]
    pub outstanding_timeout: Duration,

    /// Subscriptions held for the lifetime of the session.
    #[serde(default)]
    pub subscriptions: Vec<PollSpec>,
}

fn default_outstanding_timeout() -> Duration {
    DEFAULT_OUTSTANDING_TIMEOUT
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            outstanding_timeout: DEFAULT_OUTSTANDING_TIMEOUT,
            subscriptions: Vec::new(),
        }
    }
}

/// Query gateway settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Deadline for remote queries.
    #[serde(
        rename = "query_timeout_ms",
        with = "duration_ms",
        default = "default_query_timeout"
    )]
    pub query_timeout: Duration,
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Complete configuration for one telemetry session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Settings for keys without an entry in [`StoreConfig::buffers`].
    #[serde(default)]
    pub default_buffer: BufferConfig,

    /// Per-key overrides, applied as factories when the store starts.
    #[serde(default)]
    pub buffers: BTreeMap<Key, BufferConfig>,

    /// Poll scheduler settings.
    #[serde(default)]
    pub poll: PollConfig,

    /// Query gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl StoreConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileAccess`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not a valid configuration, or any
    /// validation error from [`StoreConfig::validate`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::FileAccess {
            path: path.display().to_string(),
            source: e,
        })?;

        let config: Self = serde_json::from_str(&json).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or a validation error.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section of the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<()> {
        self.default_buffer.validate("default")?;

        for (key, buffer) in &self.buffers {
            buffer.validate(key.as_str())?;
        }

        if self.poll.outstanding_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration {
                setting: "poll.outstanding_timeout_ms",
                value: self.poll.outstanding_timeout,
                reason: "must be > 0".to_string(),
            }
            .into());
        }

        for spec in &self.poll.subscriptions {
            spec.validate()?;
        }

        if self.gateway.query_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration {
                setting: "gateway.query_timeout_ms",
                value: self.gateway.query_timeout,
                reason: "must be > 0".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Returns the buffer settings that apply to `key`.
    pub fn buffer_for(&self, key: &str) -> BufferConfig {
        self.buffers.get(key).copied().unwrap_or(self.default_buffer)
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::cast_possible_truncation)] // u64 millis covers ~584 million years
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
