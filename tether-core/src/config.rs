//! Layer configuration.
//!
//! Configuration is read from TOML with every duration expressed in
//! milliseconds, then optionally overridden from `TETHER_*` environment
//! variables (a `.env` file is honored).
//!
//! ```toml
//! auto_replay = true
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 500
//!
//! [circuit_breaker]
//! failure_threshold = 3
//! recovery_timeout_ms = 30000
//!
//! [connectivity]
//! check_interval_ms = 0
//! ping_url = "/health"
//! ```

use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connectivity::ConnectivityConfig;
use crate::error::{Error, Result};
use crate::queue::QueueConfig;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Serde helpers for durations stored as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as milliseconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    /// Deserialize a duration from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Complete configuration of the resilient layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Replay the offline queue automatically when connectivity returns.
    pub auto_replay: bool,
    /// Default retry policy numbers.
    pub retry: RetryConfig,
    /// Breaker numbers shared by every resource class.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Connectivity monitoring.
    pub connectivity: ConnectivityConfig,
    /// Cache staleness.
    pub cache: CacheConfig,
    /// Offline queue persistence.
    pub queue: QueueConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            auto_replay: true,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            connectivity: ConnectivityConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl TetherConfig {
    /// Create a new configuration builder.
    pub fn builder() -> TetherConfigBuilder {
        TetherConfigBuilder::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&source)
    }

    /// Apply `TETHER_*` overrides from the process environment and `.env`.
    pub fn with_env_overrides(self) -> Result<Self> {
        dotenvy::dotenv().ok();
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `TETHER_*` overrides from `lookup`.
    ///
    /// Recognized variables: `TETHER_MAX_ATTEMPTS`, `TETHER_BASE_DELAY_MS`,
    /// `TETHER_MAX_DELAY_MS`, `TETHER_BACKOFF_FACTOR`,
    /// `TETHER_FAILURE_THRESHOLD`, `TETHER_RECOVERY_TIMEOUT_MS`,
    /// `TETHER_CHECK_INTERVAL_MS`, `TETHER_PING_URL`,
    /// `TETHER_PROBE_TIMEOUT_MS`, `TETHER_STALENESS_THRESHOLD_MS`,
    /// `TETHER_QUEUE_MAX_SIZE` and `TETHER_AUTO_REPLAY`.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Overrides(&lookup);

        if let Some(v) = env.parse("TETHER_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env.millis("TETHER_BASE_DELAY_MS")? {
            self.retry.base_delay = v;
        }
        if let Some(v) = env.millis("TETHER_MAX_DELAY_MS")? {
            self.retry.max_delay = v;
        }
        if let Some(v) = env.parse("TETHER_BACKOFF_FACTOR")? {
            self.retry.backoff_factor = v;
        }
        if let Some(v) = env.parse("TETHER_FAILURE_THRESHOLD")? {
            self.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = env.millis("TETHER_RECOVERY_TIMEOUT_MS")? {
            self.circuit_breaker.recovery_timeout = v;
        }
        if let Some(v) = env.millis("TETHER_CHECK_INTERVAL_MS")? {
            self.connectivity.check_interval = v;
        }
        if let Some(v) = lookup("TETHER_PING_URL") {
            self.connectivity.ping_url = v;
        }
        if let Some(v) = env.millis("TETHER_PROBE_TIMEOUT_MS")? {
            self.connectivity.probe_timeout = v;
        }
        if let Some(v) = env.millis("TETHER_STALENESS_THRESHOLD_MS")? {
            self.cache.staleness_threshold = v;
        }
        if let Some(v) = env.parse("TETHER_QUEUE_MAX_SIZE")? {
            self.queue.max_size = v;
        }
        if let Some(v) = env.flag("TETHER_AUTO_REPLAY") {
            self.auto_replay = v;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject configurations the components cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return Err(Error::Config("retry.backoff_factor must be at least 1".into()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.connectivity.probe_timeout.is_zero() {
            return Err(Error::Config(
                "connectivity.probe_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

struct Overrides<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Overrides<'_, F> {
    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match (self.0)(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Config(format!("{name}: cannot parse {raw:?}"))),
        }
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &str) -> Option<bool> {
        (self.0)(name).map(|raw| {
            matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }
}

/// Builder for [`TetherConfig`].
#[derive(Debug, Default)]
pub struct TetherConfigBuilder {
    config: TetherConfig,
}

impl TetherConfigBuilder {
    /// Set the retry numbers.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Set the breaker numbers.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Set connectivity monitoring.
    pub fn connectivity(mut self, config: ConnectivityConfig) -> Self {
        self.config.connectivity = config;
        self
    }

    /// Set the status assumed at start-up.
    pub fn initial_online(mut self, online: bool) -> Self {
        self.config.connectivity.initial_online = online;
        self
    }

    /// Set the periodic probe interval. Zero disables periodic probing.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.config.connectivity.check_interval = interval;
        self
    }

    /// Set the cache staleness threshold.
    pub fn staleness_threshold(mut self, threshold: Duration) -> Self {
        self.config.cache.staleness_threshold = threshold;
        self
    }

    /// Set the offline queue configuration.
    pub fn queue(mut self, config: QueueConfig) -> Self {
        self.config.queue = config;
        self
    }

    /// Enable or disable automatic replay on reconnect.
    pub fn auto_replay(mut self, enable: bool) -> Self {
        self.config.auto_replay = enable;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TetherConfig {
        self.config
    }
}
