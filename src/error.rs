//! Error types shared across the orchestration core.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::models::{FailureReason, TaskStatus};

/// Errors raised by the store, the state machine, the tool gateway and the
/// execution loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input, rejected before any state was touched.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A tool call tried to touch a path outside the task's allow-list.
    #[error("Scope violation: {} is outside the allowed roots", path.display())]
    ScopeViolation { path: PathBuf },

    /// A concurrent writer got there first.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The task still has unsatisfied dependencies.
    #[error("Task {task_id} is not ready: waiting on {} dependencies", waiting.len())]
    NotReady { task_id: Uuid, waiting: Vec<Uuid> },

    /// The state machine refused a transition.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Budget exhausted after {iterations} iterations")]
    BudgetExhausted { iterations: u32 },

    #[error("Task cancelled")]
    Cancelled,

    /// Any other terminal failure of a task run.
    #[error("Task failed: {0}")]
    TaskFailed(FailureReason),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Failures of the external reasoning service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Reasoning call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Service error: {0}")]
    Service(String),
}

impl ServiceError {
    /// Timeouts and transport failures are worth retrying; a service-side
    /// rejection is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_transport_errors_are_transient() {
        assert!(ServiceError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ServiceError::Transport("reset".into()).is_transient());
        assert!(!ServiceError::Service("bad request".into()).is_transient());
    }

    #[test]
    fn not_found_names_the_entity() {
        let err = Error::not_found("Task", "abc");
        assert_eq!(err.to_string(), "Task not found: abc");
    }
}
