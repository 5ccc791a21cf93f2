use async_trait::async_trait;
use aws_sdk_sqs::{
    types::{Message as SqsMessage, MessageSystemAttributeName, QueueAttributeName},
    Client,
};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use sl_common::InboundMessage;
use crate::{
    QueueError, QueueTransport, Result, SQS_MAX_BATCH_SIZE, SQS_MAX_VISIBILITY_TIMEOUT,
    SQS_MAX_WAIT_TIME,
};

/// AWS SQS transport.
///
/// Queue identifiers may be queue URLs or queue names; names are resolved
/// through `GetQueueUrl` once and cached.
pub struct SqsTransport {
    client: Client,
    /// Queue identifier -> queue URL
    queue_urls: DashMap<String, String>,
    /// Queue identifier -> default visibility timeout reported by SQS
    visibility_timeouts: DashMap<String, Duration>,
    /// Visibility timeout requested on every receive, overriding the queue default
    receive_visibility_timeout: Option<Duration>,
}

impl SqsTransport {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            queue_urls: DashMap::new(),
            visibility_timeouts: DashMap::new(),
            receive_visibility_timeout: None,
        }
    }

    /// Request this visibility timeout on every receive instead of the queue default.
    pub fn with_receive_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.receive_visibility_timeout = Some(timeout.min(SQS_MAX_VISIBILITY_TIMEOUT));
        self
    }

    fn is_queue_url(queue: &str) -> bool {
        queue.starts_with("https://") || queue.starts_with("http://")
    }

    /// Resolve a queue name or URL to a queue URL
    pub async fn queue_url(&self, queue: &str) -> Result<String> {
        if Self::is_queue_url(queue) {
            return Ok(queue.to_string());
        }
        if let Some(url) = self.queue_urls.get(queue) {
            return Ok(url.value().clone());
        }

        let result = self.client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("NonExistentQueue") || message.contains("QueueDoesNotExist") {
                    QueueError::QueueNotFound(queue.to_string())
                } else {
                    QueueError::Sqs(message)
                }
            })?;

        let url = result
            .queue_url()
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?
            .to_string();

        info!(queue = %queue, url = %url, "Resolved SQS queue URL");
        self.queue_urls.insert(queue.to_string(), url.clone());
        Ok(url)
    }

    fn parse_sqs_message(
        &self,
        queue: &str,
        sqs_msg: &SqsMessage,
        deadline: Instant,
    ) -> Result<InboundMessage> {
        let receipt_handle = sqs_msg.receipt_handle()
            .ok_or_else(|| QueueError::Sqs("Missing receipt handle".to_string()))?
            .to_string();

        let id = sqs_msg.message_id()
            .ok_or_else(|| QueueError::Sqs("Missing message id".to_string()))?
            .to_string();

        let body = sqs_msg.body()
            .map(|b| Bytes::copy_from_slice(b.as_bytes()))
            .unwrap_or_default();

        let mut attributes = HashMap::new();
        if let Some(system) = sqs_msg.attributes() {
            for (name, value) in system {
                attributes.insert(name.as_str().to_string(), value.clone());
            }
        }
        if let Some(custom) = sqs_msg.message_attributes() {
            for (name, value) in custom {
                if let Some(text) = value.string_value() {
                    attributes.insert(name.clone(), text.to_string());
                }
            }
        }

        Ok(InboundMessage {
            id,
            receipt_handle,
            queue: queue.to_string(),
            body,
            attributes,
            received_at: Utc::now(),
            visibility_deadline: deadline,
        })
    }

    async fn effective_visibility_timeout(&self, queue: &str) -> Result<Duration> {
        Ok(self.visibility_timeout(queue).await?.unwrap_or(Duration::from_secs(30)))
    }
}

/// Whole seconds for a visibility timeout, rounded up and never zero
fn visibility_seconds(timeout: Duration) -> i32 {
    let capped = timeout.min(SQS_MAX_VISIBILITY_TIMEOUT);
    (capped.as_secs_f64().ceil() as i32).max(1)
}

#[async_trait]
impl QueueTransport for SqsTransport {
    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        wait_time: Duration,
    ) -> Result<Vec<InboundMessage>> {
        let queue_url = self.queue_url(queue).await?;
        let visibility = self.effective_visibility_timeout(queue).await?;

        let mut request = self.client
            .receive_message()
            .queue_url(&queue_url)
            .max_number_of_messages(max_messages.clamp(1, SQS_MAX_BATCH_SIZE) as i32)
            .wait_time_seconds(wait_time.min(SQS_MAX_WAIT_TIME).as_secs() as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All");
        if let Some(timeout) = self.receive_visibility_timeout {
            request = request.visibility_timeout(visibility_seconds(timeout));
        }

        // The deadline is measured from the request, which is never later than SQS's own clock start
        let requested_at = Instant::now();
        let result = request
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;
        let deadline = requested_at + visibility;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());

        for sqs_msg in &sqs_messages {
            match self.parse_sqs_message(queue, sqs_msg, deadline) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    // Without a receipt handle or id the message cannot be tracked; it expires back to the queue
                    error!(
                        queue = %queue,
                        error = %e,
                        "Failed to parse SQS message"
                    );
                }
            }
        }

        if !messages.is_empty() {
            debug!(
                queue = %queue,
                count = messages.len(),
                "Received messages from SQS"
            );
        }

        Ok(messages)
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        let queue_url = self.queue_url(queue).await?;
        self.client
            .delete_message()
            .queue_url(&queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(
            receipt_handle = %receipt_handle,
            queue = %queue,
            "Message deleted from SQS"
        );
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<()> {
        let queue_url = self.queue_url(queue).await?;
        let seconds = visibility_seconds(timeout);

        self.client
            .change_message_visibility()
            .queue_url(&queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(
            receipt_handle = %receipt_handle,
            queue = %queue,
            seconds = seconds,
            "Visibility changed in SQS"
        );
        Ok(())
    }

    /// The timeout every received message actually gets: the receive
    /// override when set, otherwise the queue's `VisibilityTimeout` attribute.
    async fn visibility_timeout(&self, queue: &str) -> Result<Option<Duration>> {
        if let Some(timeout) = self.receive_visibility_timeout {
            return Ok(Some(timeout));
        }
        if let Some(timeout) = self.visibility_timeouts.get(queue) {
            return Ok(Some(*timeout.value()));
        }

        let queue_url = self.queue_url(queue).await?;
        let result = self.client
            .get_queue_attributes()
            .queue_url(&queue_url)
            .attribute_names(QueueAttributeName::VisibilityTimeout)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let timeout = result
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::VisibilityTimeout))
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        if let Some(timeout) = timeout {
            debug!(queue = %queue, seconds = timeout.as_secs(), "Retrieved SQS visibility timeout");
            self.visibility_timeouts.insert(queue.to_string(), timeout);
        }

        Ok(timeout)
    }
}
