//! Error types for the task timer.

use crate::models::{TaskId, TaskKey};
use crate::signal::ActionKind;

/// Top-level error type for the scheduling engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// A task identity expected in the working set is absent.
    #[error("task not found: {0}")]
    TaskNotFound(TaskKey),

    /// No schedulable instance carries this id.
    #[error("no task with id {0}")]
    IdNotFound(TaskId),

    /// Action name or kind the receiver cannot apply.
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// An action arrived without the argument it operates on.
    #[error("action {kind} requires {what}")]
    MissingArgument { kind: ActionKind, what: &'static str },

    /// Malformed user input (dates, durations, recurrence codes).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Persistent store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A blocking store call could not be joined.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TimerError>;
