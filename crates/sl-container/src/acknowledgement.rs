use sl_common::InboundMessage;
use sl_queue::{QueueTransport, Result as QueueResult};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metrics::MetricsRecorder;
use crate::visibility::WatchRegistration;

/// Handle given to a handler to delete its message before it returns.
///
/// The first call to [`acknowledge`](Self::acknowledge) deletes the message;
/// later calls, and the container's own policy-driven delete, become no-ops.
/// At most one delete is attempted per received message.
#[derive(Clone)]
pub struct Acknowledgement {
    inner: Arc<AckInner>,
}

struct AckInner {
    queue: String,
    message_id: String,
    receipt_handle: String,
    transport: Arc<dyn QueueTransport>,
    watch: Option<WatchRegistration>,
    acknowledged: AtomicBool,
    metrics: Arc<MetricsRecorder>,
}

impl Acknowledgement {
    pub(crate) fn new(
        message: &InboundMessage,
        transport: Arc<dyn QueueTransport>,
        watch: Option<WatchRegistration>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            inner: Arc::new(AckInner {
                queue: message.queue.clone(),
                message_id: message.id.clone(),
                receipt_handle: message.receipt_handle.clone(),
                transport,
                watch,
                acknowledged: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    /// Delete the message now. Returns `Ok` without a transport call if it was already acknowledged.
    pub async fn acknowledge(&self) -> QueueResult<()> {
        let inner = &self.inner;
        if inner.acknowledged.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(watch) = &inner.watch {
            watch.finalize().await;
        }

        match inner.transport.delete(&inner.queue, &inner.receipt_handle).await {
            Ok(()) => {
                inner.metrics.record_deleted(&inner.queue);
                debug!(
                    message_id = %inner.message_id,
                    queue = %inner.queue,
                    "Message deleted"
                );
                Ok(())
            }
            Err(e) => {
                inner.metrics.record_delete_failure(&inner.queue);
                warn!(
                    message_id = %inner.message_id,
                    queue = %inner.queue,
                    error = %e,
                    "Failed to delete message"
                );
                Err(e)
            }
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.acknowledged.load(Ordering::Acquire)
    }

    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("queue", &self.inner.queue)
            .field("message_id", &self.inner.message_id)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}
