//! Lock configuration.

use crate::error::{LockError, LockResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default namespace for lock keys.
pub const DEFAULT_KEY_PREFIX: &str = "/leasehold/locks/";

/// Lock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease TTL. Bounds how long a crashed holder blocks others.
    #[serde(with = "duration_secs", default = "default_ttl")]
    pub ttl: Duration,
    /// Prefix prepended to lock names to form store keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Keep-alive interval. Defaults to a third of the TTL.
    #[serde(with = "option_millis", default)]
    pub keep_alive_interval: Option<Duration>,
    /// Consecutive keep-alive failures before the session is declared dead.
    #[serde(default = "default_max_keep_alive_failures")]
    pub max_keep_alive_failures: u32,
    /// Attempts for single-shot store operations on transient errors.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay.
    #[serde(with = "duration_millis", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    /// Retry delay cap.
    #[serde(with = "duration_millis", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

fn default_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_max_keep_alive_failures() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(2)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            key_prefix: default_key_prefix(),
            keep_alive_interval: None,
            max_keep_alive_failures: default_max_keep_alive_failures(),
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl LockConfig {
    /// Create a configuration with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> LockConfigBuilder {
        LockConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> LockConfigBuilder {
        let mut builder = LockConfigBuilder::new();

        if let Ok(ttl) = std::env::var("LEASEHOLD_TTL")
            && let Ok(secs) = ttl.parse() {
                builder = builder.ttl(Duration::from_secs(secs));
            }

        if let Ok(prefix) = std::env::var("LEASEHOLD_KEY_PREFIX") {
            builder = builder.key_prefix(prefix);
        }

        if let Ok(interval) = std::env::var("LEASEHOLD_KEEP_ALIVE_INTERVAL_MS")
            && let Ok(millis) = interval.parse() {
                builder = builder.keep_alive_interval(Duration::from_millis(millis));
            }

        if let Ok(failures) = std::env::var("LEASEHOLD_MAX_KEEP_ALIVE_FAILURES")
            && let Ok(failures) = failures.parse() {
                builder = builder.max_keep_alive_failures(failures);
            }

        builder
    }

    /// Parse configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> LockResult<Self> {
        toml::from_str(content)
            .map_err(|e| LockError::Config(format!("TOML parse error: {}", e)))
    }

    /// Parse configuration from a JSON document.
    pub fn from_json_str(content: &str) -> LockResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| LockError::Config(format!("JSON parse error: {}", e)))
    }

    /// Load configuration from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> LockResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LockError::Config(format!("Failed to read file: {}", e)))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(LockError::Config(format!(
                "Unsupported format: {}",
                other.unwrap_or("none")
            ))),
        }
    }

    /// TTL in whole seconds as requested from the store, at least one.
    pub fn ttl_secs(&self) -> i64 {
        let secs = self.ttl.as_secs() + u64::from(self.ttl.subsec_nanos() > 0);
        i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
    }

    /// Keep-alive interval in effect.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval.unwrap_or(self.ttl / 3)
    }

    /// Store key for a lock name.
    pub fn lock_key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Reject settings that leave no renewal margin.
    pub fn validate(&self) -> LockResult<()> {
        if self.ttl < Duration::from_secs(1) {
            return Err(LockError::Config(format!(
                "ttl must be at least one second, got {:?}",
                self.ttl
            )));
        }

        let interval = self.keep_alive_interval();
        if interval.is_zero() || interval >= self.ttl {
            return Err(LockError::Config(format!(
                "keep-alive interval {:?} must be positive and shorter than ttl {:?}",
                interval, self.ttl
            )));
        }

        if self.max_keep_alive_failures == 0 {
            return Err(LockError::Config(
                "max_keep_alive_failures must be at least 1".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(LockError::Config("max_attempts must be at least 1".to_string()));
        }

        if self.initial_backoff > self.max_backoff {
            return Err(LockError::Config(
                "initial_backoff must not exceed max_backoff".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for lock configuration.
#[derive(Default)]
pub struct LockConfigBuilder {
    config: LockConfig,
}

impl LockConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: LockConfig::default(),
        }
    }

    /// Set the lease TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Set the key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Set the keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = Some(interval);
        self
    }

    /// Set the consecutive keep-alive failure limit.
    pub fn max_keep_alive_failures(mut self, failures: u32) -> Self {
        self.config.max_keep_alive_failures = failures;
        self
    }

    /// Set the attempt limit for single-shot operations.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the retry backoff bounds.
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.initial_backoff = initial;
        self.config.max_backoff = max;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> LockConfig {
        self.config
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
