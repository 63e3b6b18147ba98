use thiserror::Error;

/// Errors surfaced when submitting a task.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The submission was rejected before touching either store.
    #[error("invalid task submission: {0}")]
    Validation(String),

    /// The durable insert failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Errors surfaced by the task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A different handler is already registered under this name.
    #[error("task `{0}` is already registered with a different handler")]
    Conflict(String),

    /// No handler is registered under this name. Non-retryable at
    /// execution time.
    #[error("unknown task `{0}`")]
    UnknownTask(String),
}

/// Errors surfaced by a broker backend.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached or rejected the operation.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by queue manager operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The metadata store failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// The broker failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
