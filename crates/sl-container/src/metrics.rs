//! Container counters.
//!
//! Every event is counted twice: in process-local atomics exposed through
//! [`ContainerMetrics`] snapshots, and through the `metrics` facade for
//! whichever recorder (Prometheus or otherwise) the application installs.

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of a container's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContainerMetrics {
    pub received: u64,
    pub filtered: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deleted: u64,
    pub delete_failures: u64,
    pub extensions: u64,
    pub extension_failures: u64,
    pub poll_errors: u64,
    pub abandoned: u64,
}

pub(crate) struct MetricsRecorder {
    container_id: String,
    received: AtomicU64,
    filtered: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    deleted: AtomicU64,
    delete_failures: AtomicU64,
    extensions: AtomicU64,
    extension_failures: AtomicU64,
    poll_errors: AtomicU64,
    abandoned: AtomicU64,
}

impl MetricsRecorder {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            received: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            delete_failures: AtomicU64::new(0),
            extensions: AtomicU64::new(0),
            extension_failures: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> ContainerMetrics {
        ContainerMetrics {
            received: self.received.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
            extensions: self.extensions.load(Ordering::Relaxed),
            extension_failures: self.extension_failures.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, name: &'static str, queue: &str, count: u64) {
        counter!(
            name,
            "container" => self.container_id.clone(),
            "queue" => queue.to_string()
        )
        .increment(count);
    }

    pub fn record_received(&self, queue: &str, count: usize) {
        self.received.fetch_add(count as u64, Ordering::Relaxed);
        self.emit("sl_messages_received_total", queue, count as u64);
    }

    pub fn record_filtered(&self, queue: &str) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
        self.emit("sl_messages_filtered_total", queue, 1);
    }

    pub fn record_processed(&self, queue: &str, success: bool, duration: Duration) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        counter!(
            "sl_messages_processed_total",
            "container" => self.container_id.clone(),
            "queue" => queue.to_string(),
            "success" => success.to_string()
        )
        .increment(1);
        histogram!(
            "sl_handler_duration_seconds",
            "container" => self.container_id.clone(),
            "queue" => queue.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_deleted(&self, queue: &str) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
        self.emit("sl_messages_deleted_total", queue, 1);
    }

    pub fn record_delete_failure(&self, queue: &str) {
        self.delete_failures.fetch_add(1, Ordering::Relaxed);
        self.emit("sl_delete_failures_total", queue, 1);
    }

    pub fn record_extension(&self, queue: &str, success: bool) {
        if success {
            self.extensions.fetch_add(1, Ordering::Relaxed);
            self.emit("sl_visibility_extensions_total", queue, 1);
        } else {
            self.extension_failures.fetch_add(1, Ordering::Relaxed);
            self.emit("sl_visibility_extension_failures_total", queue, 1);
        }
    }

    pub fn record_poll_error(&self, queue: &str) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
        self.emit("sl_poll_errors_total", queue, 1);
    }

    pub fn record_abandoned(&self, queue: &str, count: usize) {
        self.abandoned.fetch_add(count as u64, Ordering::Relaxed);
        self.emit("sl_messages_abandoned_total", queue, count as u64);
    }

    pub fn set_inflight(&self, queue: &str, inflight: usize) {
        gauge!(
            "sl_messages_inflight",
            "container" => self.container_id.clone(),
            "queue" => queue.to_string()
        )
        .set(inflight as f64);
    }
}
