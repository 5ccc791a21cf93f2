//! Shared mocks for listener container tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Barrier, Notify};
use tokio::time::Instant;

use sl_common::InboundMessage;
use sl_container::{Acknowledgement, HandlerError, MessageHandler};
use sl_queue::{QueueError, QueueTransport};

/// Scripted transport: messages are handed out once, in push order.
///
/// Every receipt handle is `<message id>#<delivery>`.
pub struct MockTransport {
    pending: Mutex<HashMap<String, VecDeque<(String, Bytes, HashMap<String, String>)>>>,
    deliveries: AtomicU32,
    pushed: Notify,
    visibility_timeout: Option<Duration>,
    max_wait_time: Duration,
    pub deletes: Mutex<Vec<(String, String, Instant)>>,
    pub extensions: Mutex<Vec<(String, Duration, Instant)>>,
    pub received: Mutex<Vec<(String, Instant)>>,
    pub requested: Mutex<Vec<u32>>,
    pub receive_calls: AtomicU32,
    fail_receives: AtomicU32,
    fail_extensions: AtomicU32,
    fail_deletes: AtomicBool,
    fail_visibility_lookup: AtomicBool,
    over_delivery: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_visibility_timeout(Some(Duration::from_secs(30)))
    }

    pub fn with_visibility_timeout(visibility_timeout: Option<Duration>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            deliveries: AtomicU32::new(0),
            pushed: Notify::new(),
            visibility_timeout,
            max_wait_time: Duration::from_secs(20),
            deletes: Mutex::new(Vec::new()),
            extensions: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            requested: Mutex::new(Vec::new()),
            receive_calls: AtomicU32::new(0),
            fail_receives: AtomicU32::new(0),
            fail_extensions: AtomicU32::new(0),
            fail_deletes: AtomicBool::new(false),
            fail_visibility_lookup: AtomicBool::new(false),
            over_delivery: AtomicU32::new(0),
        }
    }

    pub fn push(&self, queue: &str, id: &str) {
        self.push_with_attributes(queue, id, HashMap::new());
    }

    pub fn push_with_attributes(&self, queue: &str, id: &str, attributes: HashMap<String, String>) {
        self.pending
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back((id.to_string(), Bytes::from(format!("body-{}", id)), attributes));
        self.pushed.notify_waiters();
    }

    pub fn fail_next_receives(&self, count: u32) {
        self.fail_receives.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_extensions(&self, count: u32) {
        self.fail_extensions.store(count, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_visibility_lookup(&self, fail: bool) {
        self.fail_visibility_lookup.store(fail, Ordering::SeqCst);
    }

    /// Hand out up to `extra` messages more than each receive asks for
    pub fn over_deliver(&self, extra: u32) {
        self.over_delivery.store(extra, Ordering::SeqCst);
    }

    /// Message ids deleted so far, in delete order
    pub fn deleted_ids(&self) -> Vec<String> {
        self.deletes
            .lock()
            .iter()
            .map(|(_, receipt, _)| message_id(receipt))
            .collect()
    }

    pub fn received_ids(&self) -> Vec<String> {
        self.received.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn extension_count(&self) -> usize {
        self.extensions.lock().len()
    }

    fn take(&self, queue: &str, max: usize) -> Vec<InboundMessage> {
        let max = max + self.over_delivery.load(Ordering::SeqCst) as usize;
        let mut pending = self.pending.lock();
        let Some(messages) = pending.get_mut(queue) else {
            return Vec::new();
        };

        let now = Instant::now();
        let deadline = now + self.visibility_timeout.unwrap_or(Duration::from_secs(30));
        let mut taken = Vec::new();
        while taken.len() < max {
            let Some((id, body, attributes)) = messages.pop_front() else {
                break;
            };
            let delivery = self.deliveries.fetch_add(1, Ordering::SeqCst);
            self.received.lock().push((id.clone(), now));
            taken.push(InboundMessage {
                receipt_handle: format!("{}#{}", id, delivery),
                id,
                queue: queue.to_string(),
                body,
                attributes,
                received_at: Utc::now(),
                visibility_deadline: deadline,
            });
        }
        taken
    }
}

fn message_id(receipt: &str) -> String {
    receipt.split('#').next().unwrap_or_default().to_string()
}

#[async_trait]
impl QueueTransport for MockTransport {
    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        wait_time: Duration,
    ) -> sl_queue::Result<Vec<InboundMessage>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().push(max_messages);

        if self
            .fail_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::Sqs("service unavailable".to_string()));
        }

        let pushed = self.pushed.notified();
        tokio::pin!(pushed);
        pushed.as_mut().enable();

        let messages = self.take(queue, max_messages as usize);
        if !messages.is_empty() {
            return Ok(messages);
        }

        tokio::select! {
            _ = &mut pushed => Ok(self.take(queue, max_messages as usize)),
            _ = tokio::time::sleep(wait_time) => Ok(Vec::new()),
        }
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> sl_queue::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(QueueError::Sqs("delete rejected".to_string()));
        }
        self.deletes
            .lock()
            .push((queue.to_string(), receipt_handle.to_string(), Instant::now()));
        Ok(())
    }

    async fn change_visibility(
        &self,
        _queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> sl_queue::Result<()> {
        if self
            .fail_extensions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::Sqs("throttled".to_string()));
        }
        self.extensions
            .lock()
            .push((message_id(receipt_handle), timeout, Instant::now()));
        Ok(())
    }

    async fn visibility_timeout(&self, queue: &str) -> sl_queue::Result<Option<Duration>> {
        if self.fail_visibility_lookup.load(Ordering::SeqCst) {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        Ok(self.visibility_timeout)
    }

    fn max_wait_time(&self) -> Duration {
        self.max_wait_time
    }
}

/// What the test handler does for a given message id
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
    Sleep(Duration),
    WaitFor(Arc<Notify>),
    Rendezvous(Arc<Barrier>),
    RendezvousThenFail(Arc<Barrier>),
    AckThenSucceed,
    AckThenFail,
}

/// Handler that records calls and concurrency
pub struct TestHandler {
    behaviors: Mutex<HashMap<String, Behavior>>,
    default_behavior: Behavior,
    pub calls: Mutex<Vec<String>>,
    pub finished: Mutex<Vec<(String, Instant)>>,
    current: AtomicU32,
    max_concurrent: AtomicU32,
}

impl TestHandler {
    pub fn new() -> Self {
        Self::with_default(Behavior::Succeed)
    }

    pub fn with_default(default_behavior: Behavior) -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            default_behavior,
            calls: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            current: AtomicU32::new(0),
            max_concurrent: AtomicU32::new(0),
        }
    }

    pub fn on(self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.lock().insert(id.to_string(), behavior);
        self
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn finished_ids(&self) -> Vec<String> {
        self.finished.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    async fn run(&self, behavior: Behavior, ack: &Acknowledgement) -> Result<(), HandlerError> {
        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(HandlerError::failed("scripted failure")),
            Behavior::Panic => panic!("scripted panic"),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Behavior::WaitFor(notify) => {
                notify.notified().await;
                Ok(())
            }
            Behavior::Rendezvous(barrier) => {
                barrier.wait().await;
                Ok(())
            }
            Behavior::RendezvousThenFail(barrier) => {
                barrier.wait().await;
                Err(HandlerError::failed("scripted failure"))
            }
            Behavior::AckThenSucceed => {
                ack.acknowledge().await.map_err(|e| HandlerError::failed(e.to_string()))?;
                ack.acknowledge().await.map_err(|e| HandlerError::failed(e.to_string()))?;
                Ok(())
            }
            Behavior::AckThenFail => {
                let _ = ack.acknowledge().await;
                Err(HandlerError::failed("failed after acknowledging"))
            }
        }
    }
}

/// Decrements the concurrency counter even when the handler panics
struct ConcurrencySlot<'a>(&'a AtomicU32);

impl Drop for ConcurrencySlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageHandler for TestHandler {
    async fn handle(&self, message: &InboundMessage, ack: &Acknowledgement) -> Result<(), HandlerError> {
        self.calls.lock().push(message.id.clone());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        let _slot = ConcurrencySlot(&self.current);

        let behavior = self
            .behaviors
            .lock()
            .get(&message.id)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());

        let result = self.run(behavior, ack).await;
        self.finished.lock().push((message.id.clone(), Instant::now()));
        result
    }
}

/// Poll `condition` until it holds, failing the test after `timeout`
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run a future with a generous upper bound so a hung container fails the test
pub async fn bounded<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(60), future)
        .await
        .expect("operation timed out")
}
