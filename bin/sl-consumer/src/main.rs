//! sqs-listener Consumer
//!
//! Runs one listener container per configured endpoint against AWS SQS (or
//! LocalStack in development) and logs every message it receives.
//!
//! ## Configuration
//!
//! Settings come from `sqs-listener.toml` (see `sl_config::AppConfig::example_toml`)
//! with `SQS_LISTENER_*` environment overrides. A single endpoint can be
//! configured entirely from the environment:
//!
//! ```text
//! SQS_LISTENER_QUEUES=orders,orders-priority SQS_LISTENER_MAX_INFLIGHT=5 sl-consumer
//! ```
//!
//! ## Development Mode
//!
//! Set `SQS_LISTENER_DEV_MODE=true` to talk to LocalStack on
//! `http://localhost:4566` unless `sqs.endpoint_url` says otherwise.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::signal;
use tracing::{info, warn};

use sl_common::logging::{init_logging_with_format, LogFormat};
use sl_config::{AppConfig, ContainerConfig, EndpointConfig, SqsConfig};
use sl_container::{
    Acknowledgement, BackoffSettings, ContainerOptions, ContainerRegistry, EndpointDescriptor,
    HandlerError, InboundMessage, ListenerContainer, MessageHandler,
};
use sl_queue::sqs::SqsTransport;

const LOCALSTACK_ENDPOINT: &str = "http://localhost:4566";

/// Handler that records message metadata and succeeds
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &InboundMessage, _ack: &Acknowledgement) -> Result<(), HandlerError> {
        info!(
            message_id = %message.id,
            queue = %message.queue,
            bytes = message.body.len(),
            receive_count = ?message.receive_count(),
            attributes = message.attributes.len(),
            "Message received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    let config = AppConfig::load().context("Failed to load configuration")?;

    let format = match std::env::var("LOG_FORMAT") {
        Ok(value) => LogFormat::parse(&value),
        Err(_) => LogFormat::parse(&config.logging.format),
    };
    init_logging_with_format("sl-consumer", format);

    info!(endpoints = config.endpoints.len(), dev_mode = config.dev_mode, "Starting sqs-listener consumer");

    if config.endpoints.is_empty() {
        anyhow::bail!("No endpoints configured (add [[endpoints]] or set SQS_LISTENER_QUEUES)");
    }

    // 1. Setup AWS SQS client
    let sqs_client = build_sqs_client(&config.sqs, config.dev_mode).await;
    let mut transport = SqsTransport::new(sqs_client);
    if config.sqs.visibility_timeout_seconds > 0 {
        transport = transport
            .with_receive_visibility_timeout(Duration::from_secs(config.sqs.visibility_timeout_seconds));
    }
    let transport = Arc::new(transport);

    // 2. Build one container per endpoint
    let options = container_options(&config.container);
    let handler: Arc<dyn MessageHandler> = Arc::new(LoggingHandler);
    let mut registry = ContainerRegistry::new();

    for endpoint in &config.endpoints {
        let descriptor = endpoint_descriptor(endpoint)?;
        info!(
            container_id = %descriptor.container_id(),
            queues = ?descriptor.queues(),
            max_inflight_per_queue = descriptor.max_inflight_per_queue(),
            deletion_policy = %descriptor.deletion_policy(),
            "Creating listener container"
        );

        let container = ListenerContainer::new(descriptor, transport.clone(), handler.clone())
            .with_options(options.clone());
        registry.register(container)?;
    }

    // 3. Start
    if let Err(e) = registry.start_all().await {
        registry.stop_all().await;
        return Err(e).context("Failed to start listener containers");
    }

    info!(containers = registry.len(), "sqs-listener consumer running");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // 4. Graceful shutdown
    registry.stop_all().await;
    for id in registry.ids() {
        if let Ok(container) = registry.get(&id) {
            info!(container_id = %id, metrics = ?container.metrics(), "Final container metrics");
        }
    }

    info!("sqs-listener consumer shutdown complete");
    Ok(())
}

async fn build_sqs_client(sqs: &SqsConfig, dev_mode: bool) -> aws_sdk_sqs::Client {
    let endpoint_url = if !sqs.endpoint_url.is_empty() {
        Some(sqs.endpoint_url.clone())
    } else if dev_mode {
        Some(LOCALSTACK_ENDPOINT.to_string())
    } else {
        None
    };

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(sqs.region.clone()));
    if let Some(endpoint_url) = endpoint_url {
        info!(endpoint = %endpoint_url, "Configuring SQS client with custom endpoint");
        loader = loader.endpoint_url(endpoint_url);
    }

    let aws_config = loader.load().await;
    aws_sdk_sqs::Client::new(&aws_config)
}

fn container_options(container: &ContainerConfig) -> ContainerOptions {
    let defaults = ContainerOptions::default();
    ContainerOptions {
        shutdown_grace_period: Duration::from_secs(container.shutdown_grace_seconds),
        backoff: BackoffSettings {
            initial: Duration::from_millis(container.backoff_initial_ms),
            max: Duration::from_millis(container.backoff_max_ms),
            ..defaults.backoff
        },
        extension_tick: (container.extension_tick_ms > 0)
            .then(|| Duration::from_millis(container.extension_tick_ms)),
        extension_safety_margin: (container.extension_margin_seconds > 0)
            .then(|| Duration::from_secs(container.extension_margin_seconds)),
        ..defaults
    }
}

fn endpoint_descriptor(endpoint: &EndpointConfig) -> Result<EndpointDescriptor> {
    let mut builder = EndpointDescriptor::builder(endpoint.queues.iter().cloned())
        .with_max_inflight_per_queue(endpoint.max_inflight_per_queue)
        .with_poll_timeout(Duration::from_secs(endpoint.poll_timeout_seconds))
        .with_deletion_policy(endpoint.deletion_policy);

    if !endpoint.id.is_empty() {
        builder = builder.with_container_id(endpoint.id.clone());
    }
    if endpoint.minimum_visibility_seconds > 0 {
        builder = builder.with_minimum_visibility(Duration::from_secs(endpoint.minimum_visibility_seconds));
    } else {
        warn!(queues = ?endpoint.queues, "Visibility extension disabled for endpoint");
    }

    Ok(builder.build()?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
