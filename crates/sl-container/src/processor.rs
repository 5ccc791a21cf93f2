//! Per-message execution: run the handler, then apply the deletion policy.

use futures::FutureExt;
use sl_common::{DeletionPolicy, InboundMessage};
use sl_queue::QueueTransport;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::acknowledgement::Acknowledgement;
use crate::error::HandlerError;
use crate::handler::MessageHandler;
use crate::metrics::MetricsRecorder;
use crate::visibility::WatchRegistration;

/// Result of one handler invocation
#[derive(Debug)]
pub enum ProcessingOutcome {
    Success,
    Failure(HandlerError),
}

impl ProcessingOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success)
    }
}

/// Resources a message holds while in flight.
///
/// Dropping the guard, on any path including task abort, removes the watch
/// and then returns the permit to the queue's semaphore.
pub(crate) struct InflightGuard {
    _permit: OwnedSemaphorePermit,
    watch: Option<WatchRegistration>,
}

impl InflightGuard {
    pub fn new(permit: OwnedSemaphorePermit, watch: Option<WatchRegistration>) -> Self {
        Self { _permit: permit, watch }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Some(watch) = &self.watch {
            watch.abandon();
        }
    }
}

pub(crate) struct MessageProcessor {
    handler: Arc<dyn MessageHandler>,
    transport: Arc<dyn QueueTransport>,
    policy: DeletionPolicy,
    metrics: Arc<MetricsRecorder>,
}

impl MessageProcessor {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        transport: Arc<dyn QueueTransport>,
        policy: DeletionPolicy,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            handler,
            transport,
            policy,
            metrics,
        }
    }

    fn acknowledgement(&self, message: &InboundMessage, guard: &InflightGuard) -> Acknowledgement {
        Acknowledgement::new(
            message,
            self.transport.clone(),
            guard.watch.clone(),
            self.metrics.clone(),
        )
    }

    /// Invoke the handler once and finalize the message
    pub async fn process(&self, message: InboundMessage, guard: InflightGuard) -> ProcessingOutcome {
        let ack = self.acknowledgement(&message, &guard);
        let started = Instant::now();

        let result = AssertUnwindSafe(self.handler.handle(&message, &ack))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(())) => ProcessingOutcome::Success,
            Ok(Err(e)) => ProcessingOutcome::Failure(e),
            Err(panic) => ProcessingOutcome::Failure(HandlerError::Panicked(panic_message(panic))),
        };
        let elapsed = started.elapsed();
        let success = outcome.is_success();
        self.metrics.record_processed(&message.queue, success, elapsed);

        match &outcome {
            ProcessingOutcome::Success => debug!(
                message_id = %message.id,
                queue = %message.queue,
                duration_ms = elapsed.as_millis() as u64,
                "Message processed"
            ),
            ProcessingOutcome::Failure(e) => warn!(
                message_id = %message.id,
                queue = %message.queue,
                duration_ms = elapsed.as_millis() as u64,
                error = %e,
                "Message handler failed"
            ),
        }

        self.finish(&message, &guard, &ack, self.policy.deletes_on(success)).await;
        drop(guard);
        outcome
    }

    /// Finalize a message the filter chain rejected, as if it had succeeded
    pub async fn discard(&self, message: InboundMessage, guard: InflightGuard) {
        let ack = self.acknowledgement(&message, &guard);
        self.metrics.record_filtered(&message.queue);
        info!(
            message_id = %message.id,
            queue = %message.queue,
            policy = %self.policy,
            "Message rejected by filter"
        );

        self.finish(&message, &guard, &ack, self.policy.deletes_on(true)).await;
        drop(guard);
    }

    async fn finish(
        &self,
        message: &InboundMessage,
        guard: &InflightGuard,
        ack: &Acknowledgement,
        delete: bool,
    ) {
        // Removal before delete: no extension may follow it
        if let Some(watch) = &guard.watch {
            watch.finalize().await;
        }

        if !delete || ack.is_acknowledged() {
            return;
        }
        // Failures are logged and counted inside; the message simply expires back to the queue
        if ack.acknowledge().await.is_err() {
            debug!(message_id = %message.id, queue = %message.queue, "Delete left to visibility expiry");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
