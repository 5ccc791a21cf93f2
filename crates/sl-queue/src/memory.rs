//! In-memory queue that mimics SQS visibility semantics for local development and tests.
//!
//! Received messages stay in the queue, hidden until their visibility timeout
//! lapses, then become receivable again with a fresh receipt handle. Deleting
//! or changing visibility requires the receipt handle of the latest receive.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use sl_common::{InboundMessage, APPROXIMATE_RECEIVE_COUNT};
use crate::{QueueError, QueueTransport, Result, SQS_MAX_BATCH_SIZE, SQS_MAX_WAIT_TIME};

/// Visibility timeout applied to queues created implicitly
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

struct StoredMessage {
    id: String,
    body: Bytes,
    attributes: HashMap<String, String>,
    receive_count: u32,
    /// Set while the message is in flight
    invisible_until: Option<Instant>,
    receipt_handle: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

struct QueueState {
    visibility_timeout: Duration,
    messages: Mutex<Vec<StoredMessage>>,
    notify: Notify,
}

impl QueueState {
    fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            messages: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Take up to `max` visible messages, or report when the next hidden one reappears
    fn take_visible(&self, queue: &str, max: usize) -> (Vec<InboundMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut taken = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for stored in messages.iter_mut() {
            if taken.len() >= max {
                break;
            }
            if !stored.is_visible(now) {
                if let Some(until) = stored.invisible_until {
                    next_visible = Some(next_visible.map_or(until, |n| n.min(until)));
                }
                continue;
            }

            let receipt_handle = uuid::Uuid::new_v4().to_string();
            let deadline = now + self.visibility_timeout;
            stored.receive_count += 1;
            stored.invisible_until = Some(deadline);
            stored.receipt_handle = Some(receipt_handle.clone());

            let mut attributes = stored.attributes.clone();
            attributes.insert(
                APPROXIMATE_RECEIVE_COUNT.to_string(),
                stored.receive_count.to_string(),
            );

            taken.push(InboundMessage {
                id: stored.id.clone(),
                receipt_handle,
                queue: queue.to_string(),
                body: stored.body.clone(),
                attributes,
                received_at: Utc::now(),
                visibility_deadline: deadline,
            });
        }

        (taken, next_visible)
    }
}

/// Embedded queue with SQS-like receive/delete/change-visibility semantics
#[derive(Default)]
pub struct InMemoryQueue {
    queues: DashMap<String, Arc<QueueState>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace the settings of) a queue with the given visibility timeout
    pub fn create_queue(&self, queue: &str, visibility_timeout: Duration) {
        self.queues
            .insert(queue.to_string(), Arc::new(QueueState::new(visibility_timeout)));
        debug!(queue = %queue, visibility_timeout_ms = visibility_timeout.as_millis() as u64, "In-memory queue created");
    }

    fn queue(&self, queue: &str) -> Result<Arc<QueueState>> {
        self.queues
            .get(queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))
    }

    /// Enqueue a message, returning its id. The queue is created on first use.
    pub fn send(&self, queue: &str, body: impl Into<Bytes>) -> String {
        self.send_with_attributes(queue, body, HashMap::new())
    }

    pub fn send_with_attributes(
        &self,
        queue: &str,
        body: impl Into<Bytes>,
        attributes: HashMap<String, String>,
    ) -> String {
        let state = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(DEFAULT_VISIBILITY_TIMEOUT)))
            .value()
            .clone();

        let id = uuid::Uuid::new_v4().to_string();
        state.messages.lock().push(StoredMessage {
            id: id.clone(),
            body: body.into(),
            attributes,
            receive_count: 0,
            invisible_until: None,
            receipt_handle: None,
        });
        state.notify.notify_waiters();
        id
    }

    /// Messages currently receivable
    pub fn visible_count(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.queue(queue)
            .map(|q| q.messages.lock().iter().filter(|m| m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// Messages received but neither deleted nor expired
    pub fn in_flight_count(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.queue(queue)
            .map(|q| q.messages.lock().iter().filter(|m| !m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// All messages still stored, visible or not
    pub fn len(&self, queue: &str) -> usize {
        self.queue(queue).map(|q| q.messages.lock().len()).unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        wait_time: Duration,
    ) -> Result<Vec<InboundMessage>> {
        let state = self.queue(queue)?;
        let max = max_messages.clamp(1, SQS_MAX_BATCH_SIZE) as usize;
        let wait_deadline = Instant::now() + wait_time.min(SQS_MAX_WAIT_TIME);

        loop {
            // Register interest before checking, so a send between the check
            // and the await still wakes us.
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (messages, next_visible) = state.take_visible(queue, max);
            if !messages.is_empty() {
                debug!(queue = %queue, count = messages.len(), "Received messages from in-memory queue");
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= wait_deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map_or(wait_deadline, |n| n.min(wait_deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        let state = self.queue(queue)?;
        let mut messages = state.messages.lock();
        let position = messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::ReceiptHandleInvalid(receipt_handle.to_string()))?;
        let removed = messages.remove(position);
        debug!(queue = %queue, message_id = %removed.id, "Message deleted from in-memory queue");
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<()> {
        let state = self.queue(queue)?;
        {
            let now = Instant::now();
            let mut messages = state.messages.lock();
            let stored = messages
                .iter_mut()
                .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
                .ok_or_else(|| QueueError::ReceiptHandleInvalid(receipt_handle.to_string()))?;

            // An expired receipt cannot be extended; SQS rejects it the same way
            if stored.is_visible(now) {
                return Err(QueueError::ReceiptHandleInvalid(receipt_handle.to_string()));
            }
            stored.invisible_until = Some(now + timeout);
        }

        if timeout.is_zero() {
            state.notify.notify_waiters();
        }
        Ok(())
    }

    async fn visibility_timeout(&self, queue: &str) -> Result<Option<Duration>> {
        Ok(Some(self.queue(queue)?.visibility_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_send_and_receive() {
        let queue = InMemoryQueue::new();
        queue.create_queue("orders", Duration::from_secs(30));
        let id = queue.send("orders", "payload");

        let messages = queue.receive("orders", 10, Duration::ZERO).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].body_str(), Some("payload"));
        assert_eq!(messages[0].receive_count(), Some(1));
        assert_eq!(queue.visible_count("orders"), 0);
        assert_eq!(queue.in_flight_count("orders"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_visibility_timeout() {
        let queue = InMemoryQueue::new();
        queue.create_queue("orders", Duration::from_secs(5));
        queue.send("orders", "payload");

        let first = queue.receive("orders", 1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        // Long poll wakes up when the message becomes visible again
        let second = queue.receive("orders", 1, Duration::from_secs(20)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
        assert_eq!(second[0].receive_count(), Some(2));

        // The stale receipt no longer works
        let stale = queue.delete("orders", &first[0].receipt_handle).await;
        assert!(matches!(stale, Err(QueueError::ReceiptHandleInvalid(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue("orders", Duration::from_secs(30));

        let sender = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            sender.send("orders", "late");
        });

        let start = Instant::now();
        let messages = queue.receive("orders", 10, Duration::from_secs(20)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_visibility_extends_hiding() {
        let queue = InMemoryQueue::new();
        queue.create_queue("orders", Duration::from_secs(5));
        queue.send("orders", "payload");

        let received = queue.receive("orders", 1, Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        queue
            .change_visibility("orders", &received[0].receipt_handle, Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.visible_count("orders"), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(queue.visible_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_message() {
        let queue = InMemoryQueue::new();
        queue.send("orders", "payload");

        let received = queue.receive("orders", 1, Duration::ZERO).await.unwrap();
        tokio_test::assert_ok!(queue.delete("orders", &received[0].receipt_handle).await);
        assert!(queue.is_empty("orders"));

        // A second delete with the same receipt has nothing to remove
        tokio_test::assert_err!(queue.delete("orders", &received[0].receipt_handle).await);
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let queue = InMemoryQueue::new();
        let result = queue.receive("missing", 1, Duration::ZERO).await;
        assert!(matches!(result, Err(QueueError::QueueNotFound(_))));
    }
}
