//! Error types for manager operations and task execution.

use thiserror::Error;

use crate::util::ids::WorkerId;

/// Errors produced by the task manager's admission and lifecycle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManagerError {
    /// Admission with a cadence of zero.
    #[error("cadence must be greater than zero")]
    InvalidCadence,
    /// Admission of a job with an empty task sequence.
    #[error("job has no tasks")]
    NoTasks,
    /// Admission of a caller-formed job whose next execution time is unset.
    #[error("job next execution time is unset")]
    ZeroNextExec,
    /// Admission of a job whose id is already present in the queue.
    #[error("duplicate job id: {0}")]
    DuplicateJobId(String),
    /// Removal or replacement of an id not present in the queue.
    #[error("job not found: {0}")]
    JobNotFound(String),
    /// Operation on a manager that has been stopped.
    #[error("manager is stopped")]
    Stopped,
    /// Second attempt to take ownership of the error channel.
    #[error("error channel ownership already transferred")]
    ErrorChannelTaken,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors surfaced on the error channel by task execution.
///
/// Cloneable so a single outcome can be offered on the error channel and
/// still travel with the full result on the result channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The task reported a failure.
    #[error("task failed: {0}")]
    Failed(String),
    /// The task panicked; the panic was contained by the executing worker.
    #[error("{worker}: panic: {message}")]
    Panic {
        /// Worker that contained the panic.
        worker: WorkerId,
        /// Panic payload rendered as text.
        message: String,
    },
}

impl TaskError {
    /// Shorthand for a [`TaskError::Failed`] with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_error_display() {
        assert_eq!(
            ManagerError::InvalidCadence.to_string(),
            "cadence must be greater than zero"
        );
        assert_eq!(
            ManagerError::JobNotFound("abc123".into()).to_string(),
            "job not found: abc123"
        );
        assert_eq!(
            ManagerError::InvalidConfig("worker_count must be greater than 0".into()).to_string(),
            "invalid configuration: worker_count must be greater than 0"
        );
    }

    #[test]
    fn test_task_error_display() {
        let err = TaskError::failed("boom");
        assert_eq!(err.to_string(), "task failed: boom");

        let err = TaskError::Panic {
            worker: WorkerId(3),
            message: "index out of bounds".into(),
        };
        assert_eq!(err.to_string(), "worker-3: panic: index out of bounds");
    }
}
