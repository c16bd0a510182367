use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Failures surfaced by queue operations.
///
/// None of these are fatal to the queue identity: durable state always
/// reflects the last completed step and the operation can simply be retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The durable backend rejected a read or write.
    #[error("storage operation failed: {0}")]
    Storage(String),

    /// Persisted queue state could not be encoded or decoded.
    #[error("queue state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The downstream sink rejected the batch.
    #[error("sink delivery failed: {0}")]
    Sink(#[from] SinkError),
}

impl QueueError {
    /// Wrap a backend-specific error. Backend error types are often not
    /// `Send` (e.g. `worker::Error`), so only the rendered message is kept.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct SinkError {
    message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
