use sl_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Container {0} is stopped and cannot be restarted")]
    AlreadyStopped(String),

    #[error("Duplicate container id: {0}")]
    DuplicateContainer(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Transport error: {0}")]
    Transport(#[from] QueueError),
}

impl ListenerError {
    pub fn config(message: impl Into<String>) -> Self {
        ListenerError::Configuration(message.into())
    }
}

/// Failure reported by (or on behalf of) an application handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}
