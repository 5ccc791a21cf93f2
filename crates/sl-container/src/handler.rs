use async_trait::async_trait;
use sl_common::InboundMessage;
use std::future::Future;

use crate::acknowledgement::Acknowledgement;
use crate::error::HandlerError;

/// Application code invoked once per accepted message.
///
/// Returning `Err` (or panicking) marks the message as failed; whether it
/// is deleted then depends on the endpoint's deletion policy.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage, ack: &Acknowledgement) -> Result<(), HandlerError>;
}

/// Adapter produced by [`handler_fn`]
pub struct HandlerFn<F> {
    f: F,
}

/// Turn an async closure into a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(InboundMessage, Acknowledgement) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(InboundMessage, Acknowledgement) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &InboundMessage, ack: &Acknowledgement) -> Result<(), HandlerError> {
        (self.f)(message.clone(), ack.clone()).await
    }
}
