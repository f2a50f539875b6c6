//! The task abstraction and its outcome type.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::core::error::TaskError;

/// Outcome of a single task execution: an optional opaque payload on
/// success, a [`TaskError`] on failure.
pub type TaskResult = Result<Option<Value>, TaskError>;

/// A unit of work executed periodically by the worker pool.
///
/// Implementations must be `Send + Sync`: a task is shared between the
/// scheduler and whichever worker picks it up, and the same task value is
/// executed again on every firing of its job. The manager never mutates a
/// task.
pub trait Task: Send + Sync {
    /// Run the work unit once and report its outcome.
    fn execute(&self) -> TaskResult;
}

/// A task that executes a closure.
///
/// Convenience adapter behind `schedule_func`; also useful on its own when
/// a job mixes closures with heavier task types.
pub struct FnTask {
    function: Box<dyn Fn() -> TaskResult + Send + Sync>,
}

impl FnTask {
    /// Wrap a closure as a [`Task`].
    pub fn new<F>(function: F) -> Self
    where
        F: Fn() -> TaskResult + Send + Sync + 'static,
    {
        Self {
            function: Box::new(function),
        }
    }
}

impl Task for FnTask {
    fn execute(&self) -> TaskResult {
        (self.function)()
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").finish_non_exhaustive()
    }
}

/// A group of tasks scheduled as a unit, admitted via `schedule_job`.
///
/// `next_exec` is the absolute instant of the first firing; `None` means
/// unset, which admission rejects. The simpler admission operations
/// (`schedule_task`, `schedule_tasks`, `schedule_func`) build the job
/// internally and compute `next_exec` as now plus cadence.
#[derive(Clone)]
pub struct Job {
    /// Unique id within the queue.
    pub id: String,
    /// Interval between successive firings. Must be greater than zero.
    pub cadence: Duration,
    /// Absolute instant of the next firing.
    pub next_exec: Option<Instant>,
    /// Ordered, non-empty sequence of tasks dispatched on each firing.
    pub tasks: Vec<Arc<dyn Task>>,
}

impl Job {
    /// Create a job with an unset next execution time.
    pub fn new(id: impl Into<String>, cadence: Duration, tasks: Vec<Arc<dyn Task>>) -> Self {
        Self {
            id: id.into(),
            cadence,
            next_exec: None,
            tasks,
        }
    }

    /// Set the instant of the first firing.
    #[must_use]
    pub fn with_next_exec(mut self, next_exec: Instant) -> Self {
        self.next_exec = Some(next_exec);
        self
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cadence", &self.cadence)
            .field("next_exec", &self.next_exec)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
