use thiserror::Error;

use super::types::TaskId;

/// Errors returned by the background task manager. None of them end the session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Monitoring script is empty")]
    EmptyScript,

    #[error("Maximum number of background tasks ({limit}) already running")]
    CapacityExceeded { limit: usize },

    #[error("Failed to start background task: {reason}")]
    SpawnFailure { reason: String },

    #[error("Task {0} not found")]
    NotFound(TaskId),
}

impl TaskError {
    pub(crate) fn spawn(reason: impl std::fmt::Display) -> Self {
        TaskError::SpawnFailure {
            reason: reason.to_string(),
        }
    }
}
