use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Top-level configuration, loaded from a YAML file.
///
/// Omitted optional blocks disable the corresponding subsystem: without
/// `kafka` no broker sink is built, without `remote_url` no HTTP sink,
/// without `sqlite` no store (and therefore no retry scheduler).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    pub kafka: Option<KafkaConfig>,
    pub sqlite: Option<SqliteConfig>,
    pub remote_url: Option<RemoteUrlConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

/// Maps an ingest path to its logical destination queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub path: String,
    pub queue: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default)]
    pub brokers: Vec<String>,
    /// One of "" (plaintext), "SSL", "SASL_PLAINTEXT", "SASL_SSL".
    #[serde(default)]
    pub security_protocol: String,
    /// One of "" (disabled), "PLAIN", "SCRAM-SHA-256", "SCRAM-SHA-512".
    #[serde(default)]
    pub sasl_mechanism: String,
    #[serde(default)]
    pub sasl_username: String,
    #[serde(default)]
    pub sasl_password: String,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_kafka_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_kafka_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(default = "default_kafka_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteUrlConfig {
    pub url: String,
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_remote_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: u32,
    /// Delivery attempt ceiling. Zero means retry forever.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_interval: default_retry_interval(),
            batch_size: default_worker_batch_size(),
            max_retries: 0,
        }
    }
}

fn default_kafka_retry_max() -> u32 {
    3
}

fn default_kafka_retry_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_kafka_batch_size() -> u32 {
    100
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_remote_retries() -> u32 {
    3
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_worker_batch_size() -> u32 {
    50
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .map_err(|err| BridgeError::Config(format!("failed to read config file: {err}")))?;

        let config: Config = serde_yaml::from_str(&data)
            .map_err(|err| BridgeError::Config(format!("failed to parse config file: {err}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(BridgeError::Validation("server.host is required".into()));
        }
        if self.server.port == 0 {
            return Err(BridgeError::Validation("server.port is required".into()));
        }

        if self.routes.is_empty() {
            return Err(BridgeError::Validation(
                "at least one route must be configured".into(),
            ));
        }
        for (i, route) in self.routes.iter().enumerate() {
            if route.path.is_empty() {
                return Err(BridgeError::Validation(format!(
                    "routes[{i}].path is required"
                )));
            }
            if !route.path.starts_with('/') {
                return Err(BridgeError::Validation(format!(
                    "routes[{i}].path must begin with '/'"
                )));
            }
            if route.queue.is_empty() {
                return Err(BridgeError::Validation(format!(
                    "routes[{i}].queue is required"
                )));
            }
        }

        if self.remote_url.is_some() && self.sqlite.is_none() {
            return Err(BridgeError::Validation(
                "sqlite configuration is required when remote_url is specified".into(),
            ));
        }

        Ok(())
    }
}

/// Serde adapter for humantime-formatted duration strings ("30s", "5m").
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
