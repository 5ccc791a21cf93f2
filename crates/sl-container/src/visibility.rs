//! Visibility extension for long-running messages.
//!
//! Every in-flight message of a container with a minimum visibility gets a
//! watch. A single background task wakes on a fixed tick, finds watches
//! whose visibility deadline is closer than the minimum, and pushes the
//! deadline out through the transport.
//!
//! A watch is finalized before its message is deleted. Finalization takes
//! the watch's lock, so an extension that is already running completes
//! first and no extension starts afterwards.

use dashmap::DashMap;
use sl_common::InboundMessage;
use sl_queue::QueueTransport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::metrics::MetricsRecorder;

/// Shortest tick the extender will run at
pub const MIN_EXTENSION_TICK: Duration = Duration::from_millis(100);

/// Tick used when none is configured: a third of the minimum visibility
pub fn default_tick(minimum_visibility: Duration) -> Duration {
    (minimum_visibility / 3).max(MIN_EXTENSION_TICK)
}

/// Tick the extender actually runs at for an optional override.
///
/// Must stay below the minimum visibility, otherwise a deadline can pass
/// between two ticks.
pub(crate) fn effective_tick(minimum_visibility: Duration, tick: Option<Duration>) -> Duration {
    tick.map(|t| t.max(MIN_EXTENSION_TICK))
        .unwrap_or_else(|| default_tick(minimum_visibility))
}

#[derive(Debug)]
struct VisibilityWatch {
    message_id: String,
    queue: String,
    receipt_handle: String,
    deadline: Instant,
}

#[derive(Debug)]
struct WatchSlot {
    watch: Mutex<VisibilityWatch>,
    finalized: AtomicBool,
}

pub struct VisibilityExtender {
    container_id: String,
    minimum_visibility: Duration,
    safety_margin: Duration,
    tick: Duration,
    transport: Arc<dyn QueueTransport>,
    watches: DashMap<u64, Arc<WatchSlot>>,
    next_key: AtomicU64,
    metrics: Arc<MetricsRecorder>,
}

impl VisibilityExtender {
    pub(crate) fn new(
        container_id: impl Into<String>,
        minimum_visibility: Duration,
        tick: Option<Duration>,
        safety_margin: Option<Duration>,
        transport: Arc<dyn QueueTransport>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let tick = effective_tick(minimum_visibility, tick);
        Self {
            container_id: container_id.into(),
            minimum_visibility,
            safety_margin: safety_margin.unwrap_or(tick),
            tick,
            transport,
            watches: DashMap::new(),
            next_key: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn minimum_visibility(&self) -> Duration {
        self.minimum_visibility
    }

    /// Number of messages currently watched
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Start watching a freshly received message
    pub(crate) fn register(self: &Arc<Self>, message: &InboundMessage) -> WatchRegistration {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(WatchSlot {
            watch: Mutex::new(VisibilityWatch {
                message_id: message.id.clone(),
                queue: message.queue.clone(),
                receipt_handle: message.receipt_handle.clone(),
                deadline: message.visibility_deadline,
            }),
            finalized: AtomicBool::new(false),
        });
        self.watches.insert(key, slot.clone());

        WatchRegistration {
            key,
            slot,
            extender: self.clone(),
        }
    }

    /// Extend every watch whose remaining visibility dropped below the minimum
    pub async fn extend_due(&self) {
        // Collect first; the map must not be held across the transport call
        let candidates: Vec<Arc<WatchSlot>> = self
            .watches
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for slot in candidates {
            let mut watch = slot.watch.lock().await;
            if slot.finalized.load(Ordering::Acquire) {
                continue;
            }

            let now = Instant::now();
            if watch.deadline.saturating_duration_since(now) >= self.minimum_visibility {
                continue;
            }

            let timeout = self.minimum_visibility + self.safety_margin;
            match self
                .transport
                .change_visibility(&watch.queue, &watch.receipt_handle, timeout)
                .await
            {
                Ok(()) => {
                    watch.deadline = now + timeout;
                    self.metrics.record_extension(&watch.queue, true);
                    debug!(
                        message_id = %watch.message_id,
                        queue = %watch.queue,
                        extension_ms = timeout.as_millis() as u64,
                        "Extended visibility for long-running message"
                    );
                }
                Err(e) => {
                    self.metrics.record_extension(&watch.queue, false);
                    warn!(
                        message_id = %watch.message_id,
                        queue = %watch.queue,
                        error = %e,
                        "Failed to extend visibility for long-running message"
                    );
                }
            }
        }
    }

    /// Spawn the extension loop; it runs until `shutdown_rx` fires
    pub fn spawn(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let extender = self.clone();
        let span = info_span!("visibility_extender", container_id = %self.container_id);

        tokio::spawn(
            async move {
                let mut ticker = interval(extender.tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                info!(
                    tick_ms = extender.tick.as_millis() as u64,
                    minimum_visibility_ms = extender.minimum_visibility.as_millis() as u64,
                    "Visibility extender started"
                );

                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("Visibility extender shutting down");
                            break;
                        }
                        _ = ticker.tick() => {
                            extender.extend_due().await;
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Drop every watch without waiting on in-progress extensions
    pub(crate) fn clear(&self) {
        for entry in self.watches.iter() {
            entry.value().finalized.store(true, Ordering::Release);
        }
        self.watches.clear();
    }
}

/// Handle tying one in-flight message to its watch.
///
/// Cloning shares the same watch; finalizing any clone finalizes it for all.
#[derive(Clone)]
pub struct WatchRegistration {
    key: u64,
    slot: Arc<WatchSlot>,
    extender: Arc<VisibilityExtender>,
}

impl WatchRegistration {
    /// Stop watching and wait out any extension already in progress
    pub async fn finalize(&self) {
        self.abandon();
        let _settled = self.slot.watch.lock().await;
    }

    /// Stop watching without waiting
    pub fn abandon(&self) {
        self.slot.finalized.store(true, Ordering::Release);
        self.extender.watches.remove(&self.key);
    }

    pub fn is_finalized(&self) -> bool {
        self.slot.finalized.load(Ordering::Acquire)
    }

    /// Current visibility deadline as last extended
    pub async fn deadline(&self) -> Instant {
        self.slot.watch.lock().await.deadline
    }
}
