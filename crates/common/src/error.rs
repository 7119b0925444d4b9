//! Error types for the task DAG scheduler

use thiserror::Error;

/// Main error type for the scheduler
#[derive(Error, Debug)]
pub enum Error {
    /// DAG or config validation failed
    #[error("validation failed: {0}")]
    Validation(String),

    /// A task execution failed (contained at the task boundary)
    #[error("task execution failed: {0}")]
    TaskFailure(String),

    /// A task, its dependency, or the whole DAG timed out
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A task or the DAG was cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Graph structure errors: missing node, duplicate id, illegal transition
    #[error("graph error: {0}")]
    Graph(String),

    /// No executor registered for a task type
    #[error("no executor registered for type {0:?}")]
    NoExecutor(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors (shell executor, snapshot files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error kind is retryable in principle. Final retry
    /// eligibility also depends on the task's own `retryCount`/`maxRetries`
    /// and on whether the failure was timeout-induced (never retryable).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TaskFailure(_))
    }
}
