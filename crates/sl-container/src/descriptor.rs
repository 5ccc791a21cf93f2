//! Endpoint descriptor: the immutable settings of one logical consumer.

use std::collections::HashSet;
use std::time::Duration;

use sl_common::DeletionPolicy;
use crate::error::ListenerError;
use crate::Result;

/// Inflight limit applied when the caller does not choose one
pub const DEFAULT_MAX_INFLIGHT_PER_QUEUE: u32 = 10;

/// Long-poll wait applied when the caller does not choose one
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by every queue of a listener container.
///
/// Built once through [`EndpointDescriptor::builder`] and never mutated.
/// Transport-dependent limits (maximum long-poll wait, queue visibility
/// timeout) are checked when the container starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    queues: Vec<String>,
    container_id: String,
    max_inflight_per_queue: u32,
    poll_timeout: Duration,
    minimum_visibility: Option<Duration>,
    deletion_policy: DeletionPolicy,
}

impl EndpointDescriptor {
    pub fn builder<I, S>(queues: I) -> EndpointDescriptorBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EndpointDescriptorBuilder::new(queues)
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn max_inflight_per_queue(&self) -> u32 {
        self.max_inflight_per_queue
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// `None` disables visibility extension
    pub fn minimum_visibility(&self) -> Option<Duration> {
        self.minimum_visibility
    }

    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.deletion_policy
    }
}

#[derive(Debug, Clone)]
pub struct EndpointDescriptorBuilder {
    queues: Vec<String>,
    container_id: Option<String>,
    max_inflight_per_queue: Option<u32>,
    poll_timeout: Option<Duration>,
    minimum_visibility: Option<Duration>,
    deletion_policy: DeletionPolicy,
}

impl EndpointDescriptorBuilder {
    fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            container_id: None,
            max_inflight_per_queue: None,
            poll_timeout: None,
            minimum_visibility: None,
            deletion_policy: DeletionPolicy::default(),
        }
    }

    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self
    }

    pub fn with_max_inflight_per_queue(mut self, max: u32) -> Self {
        self.max_inflight_per_queue = Some(max);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn with_minimum_visibility(mut self, minimum: Duration) -> Self {
        self.minimum_visibility = Some(minimum);
        self
    }

    pub fn with_deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = policy;
        self
    }

    /// Validate and freeze the descriptor
    pub fn build(self) -> Result<EndpointDescriptor> {
        if self.queues.is_empty() {
            return Err(ListenerError::config("endpoint must name at least one queue"));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.trim().is_empty() {
                return Err(ListenerError::config("queue identifier must not be empty"));
            }
            if !seen.insert(queue.as_str()) {
                return Err(ListenerError::config(format!("queue {} is listed more than once", queue)));
            }
        }

        let max_inflight_per_queue = self.max_inflight_per_queue.unwrap_or(DEFAULT_MAX_INFLIGHT_PER_QUEUE);
        if max_inflight_per_queue == 0 {
            return Err(ListenerError::config("max_inflight_per_queue must be positive"));
        }

        if let Some(minimum) = self.minimum_visibility {
            if minimum.is_zero() {
                return Err(ListenerError::config("minimum_visibility must be positive when set"));
            }
        }

        let container_id = match self.container_id {
            Some(id) if id.trim().is_empty() => {
                return Err(ListenerError::config("container id must not be empty"));
            }
            Some(id) => id,
            None => format!("sqs-listener-{}", uuid::Uuid::new_v4()),
        };

        Ok(EndpointDescriptor {
            queues: self.queues,
            container_id,
            max_inflight_per_queue,
            poll_timeout: self.poll_timeout.unwrap_or(DEFAULT_POLL_TIMEOUT),
            minimum_visibility: self.minimum_visibility,
            deletion_policy: self.deletion_policy,
        })
    }
}
