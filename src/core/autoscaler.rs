//! Elastic worker-count policy fed by the manager metrics.
//!
//! The policy estimates steady-state concurrency demand from observed
//! throughput and average execution time (Little's law), keeps headroom for
//! bursts, and never targets fewer workers than the widest queued job needs
//! to dispatch without stalling the scheduling loop. Targets are clamped to
//! the configured bounds and offered to the pool's scaling inbox, which
//! keeps only the most recent request; the pool itself enforces the
//! downscale debounce and utilization guard.

use std::sync::Arc;

use crossbeam_channel::{select, tick, Receiver};
use tracing::trace;

use crate::config::ScalingConfig;
use crate::core::metrics::{ManagerMetrics, MetricsSnapshot};
use crate::core::worker_pool::WorkerPool;

/// Periodically evaluate the scaling policy until the stop token closes.
pub(crate) fn autoscale_loop(
    metrics: &Arc<ManagerMetrics>,
    pool: &Arc<WorkerPool>,
    config: &ScalingConfig,
    worker_count: usize,
    stop_rx: &Receiver<()>,
) {
    let ticker = tick(config.autoscale_interval());
    loop {
        select! {
            recv(ticker) -> _ => {
                let snapshot = metrics.snapshot();
                let target = compute_target(&snapshot, config, worker_count);
                trace!(
                    target,
                    tasks_per_second = f64::from(snapshot.tasks_per_second),
                    "autoscaler evaluated"
                );
                pool.request_worker_count(target);
            },
            recv(stop_rx) -> _ => return,
        }
    }
}

/// Map observed throughput and queue shape to a worker-count target.
fn compute_target(snapshot: &MetricsSnapshot, config: &ScalingConfig, worker_count: usize) -> i64 {
    let avg_secs = snapshot.average_exec_time.as_secs_f64();
    let demand = f64::from(snapshot.tasks_per_second) * avg_secs * config.headroom;
    let demand = demand.ceil() as i64;

    // A single job's tasks enter the channel back to back; keep enough
    // workers to absorb the widest job.
    let floor = i64::from(snapshot.max_job_width);

    let min = config.min_workers as i64;
    let max = config.resolved_max_workers(worker_count) as i64;
    demand.max(floor).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot(tasks_per_second: f32, avg_exec: Duration, max_job_width: u32) -> MetricsSnapshot {
        MetricsSnapshot {
            average_exec_time: avg_exec,
            total_task_executions: 0,
            tasks_per_second,
            tasks_in_queue: 0,
            max_job_width,
        }
    }

    #[test]
    fn test_idle_system_targets_min_workers() {
        let config = ScalingConfig::default();
        let target = compute_target(&snapshot(0.0, Duration::ZERO, 0), &config, 4);
        assert_eq!(target, 1);
    }

    #[test]
    fn test_demand_scales_with_throughput() {
        let config = ScalingConfig::default();
        // 10 tasks/s at 500ms average: 5 concurrent on average, x2 headroom.
        let target = compute_target(&snapshot(10.0, Duration::from_millis(500), 1), &config, 4);
        assert_eq!(target, 10);
    }

    #[test]
    fn test_wide_job_sets_floor() {
        let config = ScalingConfig::default();
        let target = compute_target(&snapshot(0.1, Duration::from_millis(10), 6), &config, 4);
        assert_eq!(target, 6);
    }

    #[test]
    fn test_target_clamped_to_max() {
        let config = ScalingConfig::default();
        // Demand of 200 clamps to 4x the configured worker count.
        let target = compute_target(&snapshot(100.0, Duration::from_secs(1), 1), &config, 4);
        assert_eq!(target, 16);
    }

    #[test]
    fn test_explicit_bounds_respected() {
        let config = ScalingConfig::default().with_worker_bounds(2, 8);
        assert_eq!(compute_target(&snapshot(0.0, Duration::ZERO, 0), &config, 4), 2);
        assert_eq!(
            compute_target(&snapshot(100.0, Duration::from_secs(1), 1), &config, 4),
            8
        );
    }
}
