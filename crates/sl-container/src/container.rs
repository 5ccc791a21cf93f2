//! Listener container: one poller per queue of an endpoint, plus the
//! shared visibility extender, behind a start/stop lifecycle.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use sl_queue::QueueTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backoff::BackoffSettings;
use crate::descriptor::EndpointDescriptor;
use crate::error::ListenerError;
use crate::filter::SinkFilterChain;
use crate::handler::MessageHandler;
use crate::metrics::{ContainerMetrics, MetricsRecorder};
use crate::poller::{Poller, PollerState, PollerStatus};
use crate::processor::MessageProcessor;
use crate::visibility::{effective_tick, VisibilityExtender};
use crate::Result;

/// Extra time `stop()` allows on top of grace period and poll timeout
const STOP_SLACK: Duration = Duration::from_secs(5);

/// Runtime knobs that are not part of the endpoint itself
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// How long in-flight handlers may run after `stop()` before they are aborted
    pub shutdown_grace_period: Duration,
    pub backoff: BackoffSettings,
    /// Overrides the extension tick derived from the minimum visibility
    pub extension_tick: Option<Duration>,
    /// Overrides the extension safety margin (defaults to the tick)
    pub extension_safety_margin: Option<Duration>,
    /// Pause after a receive that returned nothing
    pub empty_poll_pause: Duration,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            shutdown_grace_period: Duration::from_secs(30),
            backoff: BackoffSettings::default(),
            extension_tick: None,
            extension_safety_margin: None,
            empty_poll_pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
}

struct QueueRuntime {
    semaphore: Arc<Semaphore>,
    status: Arc<PollerStatus>,
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    pollers: Vec<JoinHandle<()>>,
    extender: Option<(Arc<VisibilityExtender>, broadcast::Sender<()>, JoinHandle<()>)>,
}

struct Lifecycle {
    state: ContainerState,
    running: Option<Running>,
}

pub struct ListenerContainer {
    descriptor: EndpointDescriptor,
    transport: Arc<dyn QueueTransport>,
    handler: Arc<dyn MessageHandler>,
    filter: Arc<SinkFilterChain>,
    options: ContainerOptions,
    metrics: Arc<MetricsRecorder>,
    queues: IndexMap<String, QueueRuntime>,
    /// Serializes start/stop
    transition: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
}

impl ListenerContainer {
    pub fn new(
        descriptor: EndpointDescriptor,
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let queues = descriptor
            .queues()
            .iter()
            .map(|queue| {
                let runtime = QueueRuntime {
                    semaphore: Arc::new(Semaphore::new(descriptor.max_inflight_per_queue() as usize)),
                    status: Arc::new(PollerStatus::new()),
                };
                (queue.clone(), runtime)
            })
            .collect();

        Self {
            metrics: Arc::new(MetricsRecorder::new(descriptor.container_id())),
            descriptor,
            transport,
            handler,
            filter: Arc::new(SinkFilterChain::new()),
            options: ContainerOptions::default(),
            queues,
            transition: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                state: ContainerState::Created,
                running: None,
            }),
        }
    }

    pub fn with_filter(mut self, filter: SinkFilterChain) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn with_options(mut self, options: ContainerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> &str {
        self.descriptor.container_id()
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ContainerState {
        self.lifecycle.lock().state
    }

    pub fn metrics(&self) -> ContainerMetrics {
        self.metrics.snapshot()
    }

    /// State of each queue's poller, in descriptor order
    pub fn poller_states(&self) -> Vec<(String, PollerState)> {
        self.queues
            .iter()
            .map(|(queue, runtime)| (queue.clone(), runtime.status.get()))
            .collect()
    }

    /// Messages of `queue` currently holding a permit
    pub fn inflight(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|runtime| {
            (self.descriptor.max_inflight_per_queue() as usize)
                .saturating_sub(runtime.semaphore.available_permits())
        })
    }

    /// Validate against the transport and begin polling every queue.
    ///
    /// A no-op while running. Fails with [`ListenerError::AlreadyStopped`]
    /// once the container has been stopped.
    pub async fn start(&self) -> Result<()> {
        let _transition = self.transition.lock().await;

        match self.state() {
            ContainerState::Running => return Ok(()),
            ContainerState::Stopped => {
                return Err(ListenerError::AlreadyStopped(self.id().to_string()));
            }
            ContainerState::Created => {}
        }

        if let Err(e) = self.validate().await {
            if matches!(e, ListenerError::Configuration(_)) {
                self.lifecycle.lock().state = ContainerState::Stopped;
                error!(container_id = %self.id(), error = %e, "Listener container failed to start");
            }
            return Err(e);
        }

        let extender = self.descriptor.minimum_visibility().map(|minimum| {
            let extender = Arc::new(VisibilityExtender::new(
                self.id(),
                minimum,
                self.options.extension_tick,
                self.options.extension_safety_margin,
                self.transport.clone(),
                self.metrics.clone(),
            ));
            let (stop_tx, stop_rx) = broadcast::channel(1);
            let handle = extender.spawn(stop_rx);
            (extender, stop_tx, handle)
        });

        let processor = Arc::new(MessageProcessor::new(
            self.handler.clone(),
            self.transport.clone(),
            self.descriptor.deletion_policy(),
            self.metrics.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let pollers = self
            .queues
            .iter()
            .map(|(queue, runtime)| {
                Poller {
                    container_id: self.id().to_string(),
                    queue: queue.clone(),
                    max_inflight: self.descriptor.max_inflight_per_queue(),
                    poll_timeout: self.descriptor.poll_timeout(),
                    grace_period: self.options.shutdown_grace_period,
                    empty_poll_pause: self.options.empty_poll_pause,
                    backoff: self.options.backoff,
                    semaphore: runtime.semaphore.clone(),
                    status: runtime.status.clone(),
                    transport: self.transport.clone(),
                    filter: self.filter.clone(),
                    processor: processor.clone(),
                    extender: extender.as_ref().map(|(extender, _, _)| extender.clone()),
                    metrics: self.metrics.clone(),
                }
                .spawn(shutdown_tx.subscribe())
            })
            .collect();

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ContainerState::Running;
            lifecycle.running = Some(Running {
                shutdown_tx,
                pollers,
                extender,
            });
        }

        info!(
            container_id = %self.id(),
            queues = ?self.descriptor.queues(),
            max_inflight_per_queue = self.descriptor.max_inflight_per_queue(),
            deletion_policy = %self.descriptor.deletion_policy(),
            "Listener container started"
        );
        Ok(())
    }

    async fn validate(&self) -> Result<()> {
        let max_wait = self.transport.max_wait_time();
        if self.descriptor.poll_timeout() > max_wait {
            return Err(ListenerError::config(format!(
                "poll timeout {:?} exceeds the transport maximum of {:?}",
                self.descriptor.poll_timeout(),
                max_wait
            )));
        }

        if let Some(minimum) = self.descriptor.minimum_visibility() {
            let tick = effective_tick(minimum, self.options.extension_tick);
            if tick >= minimum {
                return Err(ListenerError::config(format!(
                    "extension tick {:?} must be below the minimum visibility {:?}",
                    tick, minimum
                )));
            }

            for queue in self.descriptor.queues() {
                match self.transport.visibility_timeout(queue).await? {
                    Some(timeout) if minimum >= timeout => {
                        return Err(ListenerError::config(format!(
                            "minimum visibility {:?} must be below the visibility timeout {:?} of queue {}",
                            minimum, timeout, queue
                        )));
                    }
                    Some(_) => {}
                    None => warn!(
                        container_id = %self.id(),
                        queue = %queue,
                        "Transport does not report a visibility timeout, skipping minimum visibility check"
                    ),
                }
            }
        }

        Ok(())
    }

    /// Stop polling, let in-flight handlers finish within the grace period, then stop extending.
    ///
    /// Safe to call concurrently and repeatedly.
    pub async fn stop(&self) {
        let _transition = self.transition.lock().await;

        let running = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ContainerState::Stopped {
                return;
            }
            lifecycle.state = ContainerState::Stopped;
            lifecycle.running.take()
        };

        let Some(running) = running else {
            info!(container_id = %self.id(), "Listener container stopped before start");
            return;
        };

        info!(container_id = %self.id(), "Stopping listener container");
        let _ = running.shutdown_tx.send(());

        let bound = self.options.shutdown_grace_period + self.descriptor.poll_timeout() + STOP_SLACK;
        for mut handle in running.pollers {
            if tokio::time::timeout(bound, &mut handle).await.is_err() {
                warn!(container_id = %self.id(), "Poller did not stop in time, aborting");
                handle.abort();
            }
        }

        if let Some((extender, stop_tx, handle)) = running.extender {
            let _ = stop_tx.send(());
            let _ = handle.await;
            extender.clear();
        }

        info!(
            container_id = %self.id(),
            metrics = ?self.metrics.snapshot(),
            "Listener container stopped"
        );
    }
}

impl Drop for ListenerContainer {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().running.take() {
            let _ = running.shutdown_tx.send(());
            if let Some((_, stop_tx, _)) = running.extender {
                let _ = stop_tx.send(());
            }
        }
    }
}
