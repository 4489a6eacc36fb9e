//! Error types for taskq

use crate::db::TaskId;
use thiserror::Error;

/// Errors surfaced to callers of queue and store operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Task {0} kept changing underneath the update, giving up")]
    Conflict(TaskId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not allowed while workers are running")]
    WorkersRunning,

    #[error("Invalid task status: {0}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Why a task ended up Retrying or Error.
///
/// The `Display` output is what gets recorded in `last_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// No handler registered for the task type. Never retried.
    #[error("No handler for task type: {0}")]
    MissingHandler(String),

    /// The handler returned an error. Retried until attempts run out.
    #[error("{0}")]
    Handler(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Predecessor in the chain ended in Error. Never retried.
    #[error("Dependency {dependency} failed: {reason}")]
    DependencyFailed { dependency: TaskId, reason: String },

    #[error("Dependency {0} no longer exists")]
    DependencyMissing(TaskId),

    #[error("Worker lost while processing")]
    WorkerLost,
}

impl TaskFailure {
    /// Whether this failure may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskFailure::Handler(_) | TaskFailure::Panicked(_) | TaskFailure::WorkerLost
        )
    }
}
