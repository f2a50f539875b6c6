//! # Taskmill
//!
//! An in-process periodic task manager: register *jobs* (groups of tasks
//! sharing a cadence) and a long-lived scheduling engine dispatches their
//! tasks to a pool of workers at each job's declared interval.
//!
//! ## Modules
//!
//! - [`core`] - The manager, job queue, worker pool, metrics, and autoscaler
//! - [`config`] - Manager and scaling-policy configuration
//! - [`util`] - Identifier generation and telemetry helpers
//!
//! ## Examples
//!
//! ### Scheduling a closure
//!
//! ```no_run
//! use std::time::Duration;
//! use taskmill::{TaskManager, TaskResult};
//!
//! let manager = TaskManager::new(4, 16, 16).unwrap();
//!
//! let job_id = manager
//!     .schedule_func(|| -> TaskResult { Ok(None) }, Duration::from_secs(30))
//!     .unwrap();
//!
//! manager.remove_job(&job_id).unwrap();
//! manager.stop();
//! ```
//!
//! ### Consuming execution errors
//!
//! ```no_run
//! use std::time::Duration;
//! use taskmill::{TaskError, TaskManager, TaskResult};
//!
//! let manager = TaskManager::new(2, 16, 16).unwrap();
//! manager
//!     .schedule_func(
//!         || -> TaskResult { Err(TaskError::failed("upstream unreachable")) },
//!         Duration::from_secs(5),
//!     )
//!     .unwrap();
//!
//! // Until this call, errors are drained and logged internally.
//! let errors = manager.error_channel().unwrap();
//! if let Ok(err) = errors.recv_timeout(Duration::from_secs(10)) {
//!     eprintln!("task failed: {err}");
//! }
//! manager.stop();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod util;

// Re-export main types for convenience
pub use crate::config::{ManagerConfig, ScalingConfig};
pub use crate::core::{
    FnTask, Job, ManagerError, MetricsSnapshot, PoolStatus, Task, TaskError, TaskManager,
    TaskResult,
};
pub use crate::util::ids::WorkerId;
pub use crate::util::telemetry::init_tracing;
