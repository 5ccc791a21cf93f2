use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Receipt handle not found or expired: {0}")]
    ReceiptHandleInvalid(String),

    #[error("AWS SQS error: {0}")]
    Sqs(String),
}
