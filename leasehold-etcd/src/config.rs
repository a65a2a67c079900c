//! etcd connection configuration.

use leasehold_store::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// etcd configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    /// Gateway endpoints (http://host:port), tried in order.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// Timeout for unary requests.
    #[serde(with = "duration_secs", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Connection timeout.
    #[serde(with = "duration_secs", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Username for etcd authentication.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for etcd authentication.
    #[serde(default)]
    pub password: Option<String>,
}

fn default_endpoints() -> Vec<String> {
    vec!["http://localhost:2379".to_string()]
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            username: None,
            password: None,
        }
    }
}

impl EtcdConfig {
    /// Create a configuration for a single endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> EtcdConfigBuilder {
        EtcdConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> EtcdConfigBuilder {
        let mut builder = EtcdConfigBuilder::new();

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            let endpoints: Vec<String> = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            builder = builder.endpoints(endpoints);
        }

        if let Ok(timeout) = std::env::var("ETCD_REQUEST_TIMEOUT")
            && let Ok(secs) = timeout.parse() {
                builder = builder.request_timeout(Duration::from_secs(secs));
            }

        if let Ok(username) = std::env::var("ETCD_USERNAME") {
            builder = builder.username(username);
        }

        if let Ok(password) = std::env::var("ETCD_PASSWORD") {
            builder = builder.password(password);
        }

        builder
    }

    /// Whether credentials are configured.
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Check that every endpoint is a usable http(s) URL.
    pub fn validate(&self) -> StoreResult<()> {
        if self.endpoints.is_empty() {
            return Err(StoreError::Config("no etcd endpoints configured".to_string()));
        }

        for endpoint in &self.endpoints {
            let url = url::Url::parse(endpoint)
                .map_err(|e| StoreError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(StoreError::Config(format!(
                    "endpoint {} must use http or https",
                    endpoint
                )));
            }
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(StoreError::Config(
                "username and password must be set together".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for etcd configuration.
#[derive(Default)]
pub struct EtcdConfigBuilder {
    config: EtcdConfig,
}

impl EtcdConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: EtcdConfig::default(),
        }
    }

    /// Set the endpoints.
    pub fn endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    /// Add an endpoint.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoints.push(endpoint.into());
        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EtcdConfig {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EtcdConfig::default();
        assert_eq!(config.endpoints, vec!["http://localhost:2379".to_string()]);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(!config.has_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EtcdConfig::builder()
            .endpoints(vec!["http://etcd-0:2379".into()])
            .endpoint("http://etcd-1:2379")
            .request_timeout(Duration::from_secs(2))
            .username("root")
            .password("secret")
            .build();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert!(config.has_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_endpoints() {
        assert!(EtcdConfig::builder().endpoints(vec![]).build().validate().is_err());
        assert!(EtcdConfig::new("not a url").validate().is_err());
        assert!(EtcdConfig::new("ftp://etcd:2379").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_partial_credentials() {
        let config = EtcdConfig::builder().username("root").build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: EtcdConfig =
            serde_json::from_str(r#"{"endpoints": ["http://a:2379"], "request_timeout": 9}"#)
                .unwrap();
        assert_eq!(config.endpoints, vec!["http://a:2379".to_string()]);
        assert_eq!(config.request_timeout, Duration::from_secs(9));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }
}
