use async_trait::async_trait;
use sl_common::InboundMessage;
use std::time::Duration;

pub mod error;
pub mod memory;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::QueueError;
pub use memory::InMemoryQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Longest long-poll wait SQS accepts on a receive call
pub const SQS_MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Most messages SQS returns from a single receive call
pub const SQS_MAX_BATCH_SIZE: u32 = 10;

/// Longest visibility timeout SQS accepts (12 hours)
pub const SQS_MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Client side of a pull-based queue.
///
/// Every operation names the queue it targets, so a single transport can
/// serve every queue of a listener container.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Long-poll for up to `max_messages`, waiting at most `wait_time` when the queue is empty
    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        wait_time: Duration,
    ) -> Result<Vec<InboundMessage>>;

    /// Remove a message from the queue
    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<()>;

    /// Hide a message for `timeout` from now
    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Default visibility timeout of the queue, if the transport can tell
    async fn visibility_timeout(&self, _queue: &str) -> Result<Option<Duration>> {
        Ok(None)
    }

    /// Longest wait time accepted by `receive`
    fn max_wait_time(&self) -> Duration {
        SQS_MAX_WAIT_TIME
    }

    /// Most messages a single `receive` may return
    fn max_batch_size(&self) -> u32 {
        SQS_MAX_BATCH_SIZE
    }
}
