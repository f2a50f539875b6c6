//! Atomic counters and running averages over the execution-time stream.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use tracing::trace;

/// Metrics about the task manager, updated atomically and safe to read from
/// any thread.
#[derive(Debug, Default)]
pub(crate) struct ManagerMetrics {
    /// Running average execution time, in nanoseconds.
    average_exec_time_nanos: AtomicU64,
    /// Total number of tasks executed.
    total_task_executions: AtomicU64,
    /// Exponentially weighted tasks executed per second, stored as f32 bits.
    tasks_per_second_bits: AtomicU32,
    /// Total number of tasks in the queue.
    tasks_in_queue: AtomicI64,
    /// Widest job in the queue in terms of number of tasks.
    max_job_width: AtomicU32,
}

/// Point-in-time copy of the manager metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    /// Running average execution time of tasks.
    pub average_exec_time: Duration,
    /// Total number of tasks executed since start.
    pub total_task_executions: u64,
    /// Weighted average of tasks executed per second across queued jobs.
    pub tasks_per_second: f32,
    /// Total number of tasks currently scheduled.
    pub tasks_in_queue: i64,
    /// High-water mark of job width (tasks per job).
    pub max_job_width: u32,
}

impl ManagerMetrics {
    /// Consume execution times until the stream or the stop token closes,
    /// folding each sample into the running average.
    pub(crate) fn consume_exec_times(&self, exec_time_rx: &Receiver<Duration>, stop_rx: &Receiver<()>) {
        loop {
            select! {
                recv(exec_time_rx) -> sample => match sample {
                    Ok(exec_time) => self.record_exec_time(exec_time),
                    Err(_) => return,
                },
                recv(stop_rx) -> _ => return,
            }
        }
    }

    fn record_exec_time(&self, exec_time: Duration) {
        let executions = self.total_task_executions.load(Ordering::Relaxed);
        let avg_nanos = self.average_exec_time_nanos.load(Ordering::Relaxed) as u128;

        let new_avg = (avg_nanos * u128::from(executions) + exec_time.as_nanos())
            / u128::from(executions + 1);

        self.average_exec_time_nanos
            .store(new_avg as u64, Ordering::Relaxed);
        self.total_task_executions.fetch_add(1, Ordering::Relaxed);
        trace!(avg_nanos = new_avg as u64, "recorded execution time sample");
    }

    /// Fold an admission or removal into the task metrics. `task_delta` is
    /// the number of tasks added (positive) or removed (negative) and
    /// `cadence` is the cadence of the affected job.
    pub(crate) fn update_task_metrics(&self, task_delta: i64, cadence: Duration) {
        let current_count = self.tasks_in_queue.load(Ordering::Relaxed);
        let new_count = current_count + task_delta;

        if new_count <= 0 {
            self.store_tasks_per_second(0.0);
            self.tasks_in_queue.store(0, Ordering::Relaxed);
            return;
        }

        if task_delta > 0 {
            self.max_job_width
                .fetch_max(task_delta as u32, Ordering::Relaxed);
        }

        let per_job = tasks_per_second(task_delta, cadence);

        // Weighted average: new jobs contribute in proportion to their task
        // count, the previous rate in proportion to the prior queue size.
        let mixed = (per_job * task_delta.unsigned_abs() as f32
            + self.tasks_per_second() * current_count as f32)
            / new_count as f32;

        self.store_tasks_per_second(mixed);
        self.tasks_in_queue.store(new_count, Ordering::Relaxed);
    }

    pub(crate) fn tasks_per_second(&self) -> f32 {
        f32::from_bits(self.tasks_per_second_bits.load(Ordering::Relaxed))
    }

    fn store_tasks_per_second(&self, value: f32) {
        self.tasks_per_second_bits
            .store(value.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            average_exec_time: Duration::from_nanos(
                self.average_exec_time_nanos.load(Ordering::Relaxed),
            ),
            total_task_executions: self.total_task_executions.load(Ordering::Relaxed),
            tasks_per_second: self.tasks_per_second(),
            tasks_in_queue: self.tasks_in_queue.load(Ordering::Relaxed),
            max_job_width: self.max_job_width.load(Ordering::Relaxed),
        }
    }
}

/// Tasks executed per second by a group of `n_tasks` tasks sharing a cadence.
fn tasks_per_second(n_tasks: i64, cadence: Duration) -> f32 {
    if cadence.is_zero() {
        return 0.0;
    }
    n_tasks.unsigned_abs() as f32 / cadence.as_secs_f32()
}
