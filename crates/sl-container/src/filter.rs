//! Sink filters decide, before a handler runs, whether a message is
//! processed or discarded.

use std::fmt;
use std::sync::Arc;

use sl_common::InboundMessage;

/// Predicate consulted before a message reaches the handler
pub trait SinkFilter: Send + Sync {
    fn should_process(&self, message: &InboundMessage) -> bool;
}

impl<F> SinkFilter for F
where
    F: Fn(&InboundMessage) -> bool + Send + Sync,
{
    fn should_process(&self, message: &InboundMessage) -> bool {
        self(message)
    }
}

/// Filter that accepts every message
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SinkFilter for AcceptAll {
    fn should_process(&self, _message: &InboundMessage) -> bool {
        true
    }
}

/// Rejects messages that have been received more than `max` times.
///
/// Relies on the `ApproximateReceiveCount` attribute; messages without it
/// are accepted.
#[derive(Debug, Clone, Copy)]
pub struct MaxReceiveCountFilter {
    max: u32,
}

impl MaxReceiveCountFilter {
    pub fn new(max: u32) -> Self {
        Self { max }
    }
}

impl SinkFilter for MaxReceiveCountFilter {
    fn should_process(&self, message: &InboundMessage) -> bool {
        message.receive_count().map_or(true, |count| count <= self.max)
    }
}

/// Ordered filters; a message is processed only if every filter accepts it.
///
/// The empty chain accepts everything. Evaluation stops at the first reject.
#[derive(Clone, Default)]
pub struct SinkFilterChain {
    filters: Vec<Arc<dyn SinkFilter>>,
}

impl SinkFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: SinkFilter + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn push(&mut self, filter: Arc<dyn SinkFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl SinkFilter for SinkFilterChain {
    fn should_process(&self, message: &InboundMessage) -> bool {
        self.filters.iter().all(|filter| filter.should_process(message))
    }
}

impl fmt::Debug for SinkFilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkFilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}
