//! Integration tests for worker-pool scaling through the manager API.

use std::thread;
use std::time::{Duration, Instant};

use taskmill::{ManagerConfig, ScalingConfig, TaskManager};

fn wait_for<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Config with the autoscaler loop disabled, so only explicit requests
/// reach the scaling inbox.
fn manual_scaling_config(worker_count: usize, downscale_min_interval_secs: u64) -> ManagerConfig {
    ManagerConfig::new()
        .with_worker_count(worker_count)
        .with_task_buffer_size(4)
        .with_result_buffer_size(16)
        .with_scaling(
            ScalingConfig::new()
                .with_enabled(false)
                .with_downscale_min_interval_secs(downscale_min_interval_secs),
        )
}

#[test]
fn test_manual_upscale() {
    let manager = TaskManager::with_config(manual_scaling_config(2, 30)).unwrap();
    assert!(wait_for(Duration::from_secs(1), || {
        manager.pool_status().running_workers == 2
    }));

    manager.request_worker_count(6);
    assert!(wait_for(Duration::from_secs(1), || {
        manager.pool_status().running_workers == 6
    }));
    assert_eq!(manager.pool_status().target_workers, 6);

    manager.stop();
}

#[test]
fn test_downscale_debounced_after_start() {
    let manager = TaskManager::with_config(manual_scaling_config(4, 30)).unwrap();
    assert!(wait_for(Duration::from_secs(1), || {
        manager.pool_status().running_workers == 4
    }));

    // The debounce clock starts at pool creation; this request is too soon.
    manager.request_worker_count(1);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.pool_status().running_workers, 4);
    assert_eq!(manager.pool_status().target_workers, 1);

    manager.stop();
}

#[test]
fn test_downscale_stops_idle_workers() {
    let manager = TaskManager::with_config(manual_scaling_config(4, 0)).unwrap();
    assert!(wait_for(Duration::from_secs(1), || {
        manager.pool_status().running_workers == 4
    }));

    manager.request_worker_count(1);
    assert!(wait_for(Duration::from_secs(1), || {
        manager.pool_status().running_workers == 1
    }));

    manager.stop();
}

#[test]
fn test_autoscaler_converges_on_idle_pool() {
    let config = ManagerConfig::new()
        .with_worker_count(4)
        .with_task_buffer_size(4)
        .with_result_buffer_size(16)
        .with_scaling(
            ScalingConfig::new()
                .with_autoscale_interval_ms(50)
                .with_downscale_min_interval_secs(0)
                .with_worker_bounds(1, 16),
        );
    let manager = TaskManager::with_config(config).unwrap();
    assert!(wait_for(Duration::from_secs(1), || {
        manager.pool_status().running_workers == 4
    }));

    // With no scheduled work the policy targets the configured minimum.
    assert!(wait_for(Duration::from_secs(2), || {
        manager.pool_status().running_workers == 1
    }));
    assert!(manager.pool_status().scaling_events > 0);

    manager.stop();
}
