//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use sl_common::DeletionPolicy;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "sqs-listener.toml",
    "config.toml",
    "./config/sqs-listener.toml",
    "/etc/sqs-listener/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit variable lookup
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup) {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, &lookup)?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured config file does not exist");
        }

        if let Some(path) = lookup("SQS_LISTENER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvError(format!("{} has an invalid value: {}", key, val))),
        None => Ok(None),
    }
}

/// Apply environment variable overrides
fn apply_overrides<F>(config: &mut AppConfig, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Logging
    if let Some(val) = lookup("SQS_LISTENER_LOG_FORMAT") {
        config.logging.format = val;
    }

    // SQS
    if let Some(val) = lookup("SQS_LISTENER_SQS_REGION") {
        config.sqs.region = val;
    }
    if let Some(val) = lookup("SQS_LISTENER_SQS_ENDPOINT_URL") {
        config.sqs.endpoint_url = val;
    }
    if let Some(val) = parse_var(lookup, "SQS_LISTENER_SQS_VISIBILITY_TIMEOUT")? {
        config.sqs.visibility_timeout_seconds = val;
    }

    // Container
    if let Some(val) = parse_var(lookup, "SQS_LISTENER_SHUTDOWN_GRACE_SECONDS")? {
        config.container.shutdown_grace_seconds = val;
    }
    if let Some(val) = parse_var(lookup, "SQS_LISTENER_BACKOFF_INITIAL_MS")? {
        config.container.backoff_initial_ms = val;
    }
    if let Some(val) = parse_var(lookup, "SQS_LISTENER_BACKOFF_MAX_MS")? {
        config.container.backoff_max_ms = val;
    }

    // Single endpoint from the environment, for deployments without a config file
    if let Some(val) = lookup("SQS_LISTENER_QUEUES") {
        let queues: Vec<String> = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if config.endpoints.is_empty() {
            config.endpoints.push(Default::default());
        }
        let endpoint = &mut config.endpoints[0];
        endpoint.queues = queues;

        if let Some(id) = lookup("SQS_LISTENER_ENDPOINT_ID") {
            endpoint.id = id;
        }
        if let Some(val) = parse_var(lookup, "SQS_LISTENER_MAX_INFLIGHT")? {
            endpoint.max_inflight_per_queue = val;
        }
        if let Some(val) = parse_var(lookup, "SQS_LISTENER_MINIMUM_VISIBILITY_SECONDS")? {
            endpoint.minimum_visibility_seconds = val;
        }
        if let Some(val) = parse_var::<DeletionPolicy, _>(lookup, "SQS_LISTENER_DELETION_POLICY")? {
            endpoint.deletion_policy = val;
        }
    }

    // General
    if let Some(val) = lookup("SQS_LISTENER_DEV_MODE") {
        config.dev_mode = val.parse().unwrap_or(false);
    }

    Ok(())
}
