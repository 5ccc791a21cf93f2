//! sqs-listener Configuration System
//!
//! TOML-based runtime settings for the consumer binary with environment
//! variable override support.

use serde::{Deserialize, Serialize};
use sl_common::DeletionPolicy;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub sqs: SqsConfig,
    pub container: ContainerConfig,

    /// One listener container per entry
    pub endpoints: Vec<EndpointConfig>,

    /// Enable development mode (LocalStack endpoint, verbose defaults)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            sqs: SqsConfig::default(),
            container: ContainerConfig::default(),
            endpoints: Vec::new(),
            dev_mode: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "text" or "json"; `LOG_FORMAT` wins when set
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
        }
    }
}

/// AWS SQS connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    pub region: String,
    /// Custom endpoint, e.g. http://localhost:4566 for LocalStack. Empty means AWS.
    pub endpoint_url: String,
    /// Visibility timeout requested on receive; 0 keeps the queue default
    pub visibility_timeout_seconds: u64,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: String::new(),
            visibility_timeout_seconds: 0,
        }
    }
}

/// Settings shared by every listener container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub shutdown_grace_seconds: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Visibility extension tick; 0 derives it from the minimum visibility
    pub extension_tick_ms: u64,
    /// Extra time added on every extension; 0 uses the tick interval
    pub extension_margin_seconds: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_seconds: 30,
            backoff_initial_ms: 1000,
            backoff_max_ms: 10_000,
            extension_tick_ms: 0,
            extension_margin_seconds: 0,
        }
    }
}

/// A logical consumer bound to one or more queues
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Container id; generated when empty
    pub id: String,
    pub queues: Vec<String>,
    pub max_inflight_per_queue: u32,
    pub poll_timeout_seconds: u64,
    /// 0 disables visibility extension
    pub minimum_visibility_seconds: u64,
    pub deletion_policy: DeletionPolicy,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            queues: Vec::new(),
            max_inflight_per_queue: 10,
            poll_timeout_seconds: 10,
            minimum_visibility_seconds: 0,
            deletion_policy: DeletionPolicy::OnSuccess,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Reject settings no listener container could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container.backoff_initial_ms == 0 {
            return Err(ConfigError::ValidationError(
                "container.backoff_initial_ms must be positive".to_string(),
            ));
        }
        if self.container.backoff_max_ms < self.container.backoff_initial_ms {
            return Err(ConfigError::ValidationError(
                "container.backoff_max_ms must not be below backoff_initial_ms".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.queues.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "endpoints[{}] has no queues",
                    index
                )));
            }
            if endpoint.max_inflight_per_queue == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "endpoints[{}].max_inflight_per_queue must be positive",
                    index
                )));
            }
            let minimum_ms = endpoint.minimum_visibility_seconds.saturating_mul(1000);
            if minimum_ms > 0
                && self.container.extension_tick_ms > 0
                && self.container.extension_tick_ms >= minimum_ms
            {
                return Err(ConfigError::ValidationError(format!(
                    "container.extension_tick_ms must be below endpoints[{}].minimum_visibility_seconds",
                    index
                )));
            }
            if !endpoint.id.is_empty() && !ids.insert(endpoint.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate endpoint id {}",
                    endpoint.id
                )));
            }
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# sqs-listener Configuration
# Environment variables (SQS_LISTENER_*) override these settings

dev_mode = false

[logging]
format = "text"  # text or json

[sqs]
region = "us-east-1"
endpoint_url = ""  # http://localhost:4566 for LocalStack
visibility_timeout_seconds = 0  # 0 keeps the queue default

[container]
shutdown_grace_seconds = 30
backoff_initial_ms = 1000
backoff_max_ms = 10000
extension_tick_ms = 0  # 0 derives the tick from minimum_visibility_seconds
extension_margin_seconds = 0  # 0 uses the tick interval

[[endpoints]]
id = "orders"
queues = ["orders", "orders-priority"]
max_inflight_per_queue = 10
poll_timeout_seconds = 10
minimum_visibility_seconds = 30
deletion_policy = "on_success"  # always, never, on_success
"#
        .to_string()
    }
}
