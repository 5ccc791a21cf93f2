//! One polling loop per queue.
//!
//! Permits are taken before every receive, so a queue never has more
//! messages in flight than its semaphore allows.

use serde::Serialize;
use sl_common::InboundMessage;
use sl_queue::QueueTransport;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::{Backoff, BackoffSettings};
use crate::filter::{SinkFilter, SinkFilterChain};
use crate::metrics::MetricsRecorder;
use crate::processor::{InflightGuard, MessageProcessor};
use crate::visibility::VisibilityExtender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug)]
pub(crate) struct PollerStatus(AtomicU8);

impl PollerStatus {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn get(&self) -> PollerState {
        match self.0.load(Ordering::Acquire) {
            1 => PollerState::Running,
            2 => PollerState::Stopping,
            _ => PollerState::Stopped,
        }
    }

    pub fn set(&self, state: PollerState) {
        let value = match state {
            PollerState::Stopped => 0,
            PollerState::Running => 1,
            PollerState::Stopping => 2,
        };
        self.0.store(value, Ordering::Release);
    }
}

pub(crate) struct Poller {
    pub container_id: String,
    pub queue: String,
    pub max_inflight: u32,
    pub poll_timeout: Duration,
    pub grace_period: Duration,
    pub empty_poll_pause: Duration,
    pub backoff: BackoffSettings,
    pub semaphore: Arc<Semaphore>,
    pub status: Arc<PollerStatus>,
    pub transport: Arc<dyn QueueTransport>,
    pub filter: Arc<SinkFilterChain>,
    pub processor: Arc<MessageProcessor>,
    pub extender: Option<Arc<VisibilityExtender>>,
    pub metrics: Arc<MetricsRecorder>,
}

impl Poller {
    pub fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let span = info_span!("poller", container_id = %self.container_id, queue = %self.queue);
        self.status.set(PollerState::Running);
        tokio::spawn(self.run(shutdown_rx).instrument(span))
    }

    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut backoff = Backoff::new(self.backoff);
        let batch_limit = self
            .transport
            .max_batch_size()
            .min(self.max_inflight)
            .max(1) as usize;

        info!(
            max_inflight = self.max_inflight,
            poll_timeout_secs = self.poll_timeout.as_secs(),
            "Poller started"
        );

        loop {
            while let Some(result) = tasks.try_join_next() {
                log_join_result(result);
            }

            // Wait for capacity without spinning
            let first = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut permits = vec![first];
            while permits.len() < batch_limit {
                match self.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let requested = permits.len() as u32;
            let received = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                result = self.transport.receive(&self.queue, requested, self.poll_timeout) => result,
            };

            match received {
                Ok(messages) if messages.is_empty() => {
                    backoff.reset();
                    drop(permits);
                    if !self.empty_poll_pause.is_zero() {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(self.empty_poll_pause) => {}
                        }
                    }
                }
                Ok(messages) => {
                    backoff.reset();
                    self.metrics.record_received(&self.queue, messages.len());
                    debug!(count = messages.len(), requested = requested, "Dispatching messages");
                    let keep_polling = self
                        .dispatch(messages, permits, &mut tasks, &mut shutdown_rx)
                        .await;
                    self.metrics.set_inflight(&self.queue, self.inflight());
                    if !keep_polling {
                        break;
                    }
                }
                Err(e) => {
                    drop(permits);
                    self.metrics.record_poll_error(&self.queue);
                    let delay = backoff.next_delay();
                    error!(
                        error = %e,
                        attempt = backoff.attempt(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Error receiving messages, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.drain(tasks).await;
    }

    fn inflight(&self) -> usize {
        (self.max_inflight as usize).saturating_sub(self.semaphore.available_permits())
    }

    /// Hand each message to its own task. Returns `false` when shutdown
    /// arrived while waiting for capacity.
    async fn dispatch(
        &self,
        messages: Vec<InboundMessage>,
        mut permits: Vec<OwnedSemaphorePermit>,
        tasks: &mut JoinSet<()>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let total = messages.len();
        for (index, message) in messages.into_iter().enumerate() {
            let permit = match permits.pop() {
                Some(permit) => permit,
                None => {
                    warn!(message_id = %message.id, "Transport returned more messages than requested, waiting for capacity");
                    let acquired = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => None,
                        permit = self.semaphore.clone().acquire_owned() => permit.ok(),
                    };
                    match acquired {
                        Some(permit) => permit,
                        None => {
                            // Undispatched messages expire back to the queue
                            info!(
                                undispatched = total - index,
                                "Poller stopping before capacity freed up"
                            );
                            return false;
                        }
                    }
                }
            };

            let watch = self.extender.as_ref().map(|extender| extender.register(&message));
            let guard = InflightGuard::new(permit, watch);
            let processor = self.processor.clone();
            let span = info_span!("message", message_id = %message.id);

            if self.filter.should_process(&message) {
                tasks.spawn(
                    async move {
                        processor.process(message, guard).await;
                    }
                    .instrument(span),
                );
            } else {
                tasks.spawn(
                    async move {
                        processor.discard(message, guard).await;
                    }
                    .instrument(span),
                );
            }
        }
        // Remaining permits go back as `permits` drops
        true
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        self.status.set(PollerState::Stopping);

        if !tasks.is_empty() {
            info!(
                inflight = tasks.len(),
                grace_period_secs = self.grace_period.as_secs(),
                "Poller stopping, waiting for in-flight messages"
            );
        }

        let drained = tokio::time::timeout(self.grace_period, async {
            while let Some(result) = tasks.join_next().await {
                log_join_result(result);
            }
        })
        .await;

        if drained.is_err() {
            let abandoned = tasks.len();
            warn!(
                abandoned = abandoned,
                "Grace period elapsed, abandoning in-flight messages"
            );
            self.metrics.record_abandoned(&self.queue, abandoned);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.metrics.set_inflight(&self.queue, 0);
        self.status.set(PollerState::Stopped);
        info!("Poller stopped");
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!(error = %e, "Message task failed");
        }
    }
}
