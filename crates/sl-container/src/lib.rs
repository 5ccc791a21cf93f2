//! Concurrent queue listener container.
//!
//! A [`ListenerContainer`] binds one [`MessageHandler`] to the queues of an
//! [`EndpointDescriptor`]. Each queue gets its own polling task, bounded by
//! a per-queue inflight limit; accepted messages run on their own tasks and
//! are deleted according to the endpoint's [`DeletionPolicy`]. Long-running
//! messages have their visibility extended by a shared background task.
//!
//! ```rust,ignore
//! let descriptor = EndpointDescriptor::builder(["orders"])
//!     .with_max_inflight_per_queue(5)
//!     .with_minimum_visibility(Duration::from_secs(30))
//!     .build()?;
//!
//! let container = ListenerContainer::new(descriptor, transport, Arc::new(handler_fn(
//!     |message: InboundMessage, _ack: Acknowledgement| async move {
//!         tracing::info!(message_id = %message.id, "Got message");
//!         Ok(())
//!     },
//! )));
//!
//! container.start().await?;
//! // ...
//! container.stop().await;
//! ```

pub mod acknowledgement;
pub mod backoff;
pub mod container;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod handler;
pub mod metrics;
pub mod poller;
pub mod processor;
pub mod registry;
pub mod visibility;

pub use acknowledgement::Acknowledgement;
pub use backoff::BackoffSettings;
pub use container::{ContainerOptions, ContainerState, ListenerContainer};
pub use descriptor::{EndpointDescriptor, EndpointDescriptorBuilder};
pub use error::{HandlerError, ListenerError};
pub use filter::{AcceptAll, MaxReceiveCountFilter, SinkFilter, SinkFilterChain};
pub use handler::{handler_fn, HandlerFn, MessageHandler};
pub use metrics::ContainerMetrics;
pub use poller::PollerState;
pub use processor::ProcessingOutcome;
pub use registry::ContainerRegistry;

pub use sl_common::{DeletionPolicy, InboundMessage};

pub type Result<T> = std::result::Result<T, ListenerError>;
