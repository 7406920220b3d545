//! Client configuration
//!
//! Constructor-time options with sensible defaults, a builder, and JSON
//! loading. Durations are (de)serialized as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::{ClientError, ClientResult};
use crate::pool::PoolConfig;
use crate::ring::DEFAULT_POINTS_PER_ENDPOINT;

/// Configuration for the client, its pools and its ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    // -------------------------------------------------------------------------
    // Topology
    // -------------------------------------------------------------------------
    /// Server addresses, e.g. "127.0.0.1:11211".
    pub endpoints: Vec<String>,

    /// Ring positions per endpoint; more positions smooth the key spread.
    pub points_per_endpoint: usize,

    // -------------------------------------------------------------------------
    // Pooling
    // -------------------------------------------------------------------------
    /// Maximum connections (idle + in use) per endpoint.
    pub max_connections: usize,

    /// How long `acquire` waits for a connection when the pool is full.
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,

    /// Idle connections older than this are closed by the reaper.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// How often the reaper wakes up.
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,

    // -------------------------------------------------------------------------
    // I/O and retries
    // -------------------------------------------------------------------------
    /// TCP connect timeout.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Bound on one request/response round trip.
    #[serde(with = "duration_ms")]
    pub io_timeout: Duration,

    /// Extra attempts after a connection-level failure.
    pub retry_count: usize,

    /// Consecutive exhausted operations before an endpoint is reported down.
    pub down_after: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:11211".to_string()],
            points_per_endpoint: DEFAULT_POINTS_PER_ENDPOINT,
            max_connections: 16,
            acquire_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            retry_count: 1,
            down_after: 3,
        }
    }
}

impl ClientConfig {
    /// Create a new config builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(json).map_err(|err| ClientError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks limits and parses every endpoint address.
    pub fn validate(&self) -> ClientResult<()> {
        if self.max_connections == 0 {
            return Err(ClientError::Config("max_connections must be > 0".into()));
        }
        if self.points_per_endpoint == 0 {
            return Err(ClientError::Config("points_per_endpoint must be > 0".into()));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("io_timeout", self.io_timeout),
            ("reap_interval", self.reap_interval),
        ] {
            if value.is_zero() {
                return Err(ClientError::Config(format!("{name} must be non-zero")));
            }
        }
        self.parsed_endpoints().map(|_| ())
    }

    /// Parses the configured endpoint addresses.
    pub fn parsed_endpoints(&self) -> ClientResult<Vec<Endpoint>> {
        self.endpoints.iter().map(|addr| addr.parse()).collect()
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Replace the endpoint list
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn points_per_endpoint(mut self, points: usize) -> Self {
        self.config.points_per_endpoint = points;
        self
    }

    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    pub fn retry_count(mut self, retries: usize) -> Self {
        self.config.retry_count = retries;
        self
    }

    pub fn down_after(mut self, failures: u32) -> Self {
        self.config.down_after = failures;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.parsed_endpoints().unwrap().len(), 1);
    }

    #[test]
    fn builder_overrides_fields() {
        let config = ClientConfig::builder()
            .endpoints(["10.0.0.1:11211", "10.0.0.2:11211"])
            .max_connections(2)
            .io_timeout(Duration::from_millis(250))
            .retry_count(0)
            .build();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.io_timeout, Duration::from_millis(250));
        assert_eq!(config.retry_count, 0);
        assert_eq!(config.points_per_endpoint, DEFAULT_POINTS_PER_ENDPOINT);
    }

    #[test]
    fn json_uses_milliseconds_and_defaults() {
        let config = ClientConfig::from_json(
            r#"{"endpoints": ["a:1", "b:2"], "io_timeout": 1500, "max_connections": 4}"#,
        )
        .unwrap();
        assert_eq!(config.io_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"io_timeout\":1500"));
        assert_eq!(ClientConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn rejects_invalid_settings() {
        let zero_pool = ClientConfig::builder().max_connections(0).build();
        assert!(matches!(zero_pool.validate(), Err(ClientError::Config(_))));

        let zero_io = ClientConfig::builder().io_timeout(Duration::ZERO).build();
        assert!(matches!(zero_io.validate(), Err(ClientError::Config(_))));

        let bad_addr = ClientConfig::builder().endpoints(["host:notaport"]).build();
        assert!(matches!(bad_addr.validate(), Err(ClientError::InvalidAddress(_))));

        assert!(matches!(
            ClientConfig::from_json("{not json"),
            Err(ClientError::Config(_))
        ));
    }
}
