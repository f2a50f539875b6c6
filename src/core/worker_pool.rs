//! Worker pool with dedicated worker threads and elastic sizing.
//!
//! Each worker is an OS thread that selects between the shared task channel,
//! its own targeted stop signal, and the pool-wide stop signal. Task
//! execution happens in a panic-safe frame: a panicking task is contained,
//! converted to a [`TaskError::Panic`], and the worker keeps running.
//!
//! The pool scales through a one-slot inbox of target-count requests. A
//! dedicated serializer thread applies requests one at a time; senders drain
//! any stale request before enqueueing, so only the most recent target
//! matters. Downscaling is refused while utilization is at or above the
//! configured threshold, and debounced by a minimum interval.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use crossbeam_utils::sync::WaitGroup;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::core::error::TaskError;
use crate::core::task::{Task, TaskResult};
use crate::util::ids::WorkerId;

/// Point-in-time view of the pool's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStatus {
    /// Workers that have started and not yet exited.
    pub running_workers: i64,
    /// Workers currently executing a task.
    pub active_workers: i64,
    /// The most recently requested worker count.
    pub target_workers: i64,
    /// Number of scaling requests processed since start.
    pub scaling_events: u64,
    /// `active / running`, in [0, 1]. Zero when no workers run.
    pub utilization: f64,
}

/// A worker registered with the pool.
struct WorkerInfo {
    id: WorkerId,
    busy: AtomicBool,
    /// Dropping the sender closes the worker's targeted stop channel.
    /// Taking it at most once makes the stop idempotent.
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl WorkerInfo {
    /// Signal this worker to stop. Safe to call repeatedly.
    fn signal_stop(&self) {
        drop(self.stop_tx.lock().take());
    }
}

/// Outcome channels cloned into each worker at spawn time. The pool drops
/// the originals during stop, closing the channels once the last worker has
/// exited.
#[derive(Clone)]
struct OutcomeChannels {
    result_tx: Sender<TaskResult>,
    error_tx: Sender<TaskError>,
    exec_time_tx: Sender<Duration>,
}

/// State shared between the pool handle, the serializer, and the workers.
struct PoolShared {
    workers: Mutex<HashMap<WorkerId, Arc<WorkerInfo>>>,
    workers_active: AtomicI64,
    workers_running: AtomicI64,
    worker_count_target: AtomicI64,
    scaling_events: AtomicU64,
    last_downscale: Mutex<Instant>,
    next_worker_id: AtomicU64,

    utilization_threshold: f64,
    downscale_min_interval: Duration,

    task_rx: Receiver<Arc<dyn Task>>,
    /// Pool-wide stop token; closed when the pool stops.
    stop_rx: Receiver<()>,
    /// Taken and dropped during stop.
    outcomes: Mutex<Option<OutcomeChannels>>,
    /// Tracks live workers; taken and awaited during stop.
    wait_group: Mutex<Option<WaitGroup>>,
}

/// Pool of workers consuming the shared task channel.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    stop_tx: Mutex<Option<Sender<()>>>,
    scaling_tx: Sender<i64>,
    scaling_rx: Receiver<i64>,
    scaler_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with `worker_count` initial workers, consuming tasks
    /// from `task_rx` and routing outcomes to the given channels.
    pub(crate) fn new(
        worker_count: usize,
        utilization_threshold: f64,
        downscale_min_interval: Duration,
        task_rx: Receiver<Arc<dyn Task>>,
        result_tx: Sender<TaskResult>,
        error_tx: Sender<TaskError>,
        exec_time_tx: Sender<Duration>,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (scaling_tx, scaling_rx) = bounded::<i64>(1);

        let shared = Arc::new(PoolShared {
            workers: Mutex::new(HashMap::new()),
            workers_active: AtomicI64::new(0),
            workers_running: AtomicI64::new(0),
            worker_count_target: AtomicI64::new(worker_count as i64),
            scaling_events: AtomicU64::new(0),
            last_downscale: Mutex::new(Instant::now()),
            next_worker_id: AtomicU64::new(0),
            utilization_threshold,
            downscale_min_interval,
            task_rx,
            stop_rx,
            outcomes: Mutex::new(Some(OutcomeChannels {
                result_tx,
                error_tx,
                exec_time_tx,
            })),
            wait_group: Mutex::new(Some(WaitGroup::new())),
        });

        add_workers(&shared, worker_count);

        let scaler_shared = Arc::clone(&shared);
        let scaler_rx = scaling_rx.clone();
        let scaler_handle = thread::Builder::new()
            .name("pool-scaler".into())
            .spawn(move || scaling_loop(&scaler_shared, &scaler_rx))
            .expect("failed to spawn pool scaler thread");

        Self {
            shared,
            stop_tx: Mutex::new(Some(stop_tx)),
            scaling_tx,
            scaling_rx,
            scaler_handle: Mutex::new(Some(scaler_handle)),
        }
    }

    /// Number of workers currently executing a task.
    pub(crate) fn active_workers(&self) -> i64 {
        self.shared.workers_active.load(Ordering::Relaxed)
    }

    /// Number of workers that have started and not yet exited.
    pub(crate) fn running_workers(&self) -> i64 {
        self.shared.workers_running.load(Ordering::Relaxed)
    }

    /// The most recently requested worker count.
    pub(crate) fn target_workers(&self) -> i64 {
        self.shared.worker_count_target.load(Ordering::Relaxed)
    }

    /// Snapshot of the pool counters.
    pub(crate) fn status(&self) -> PoolStatus {
        PoolStatus {
            running_workers: self.running_workers(),
            active_workers: self.active_workers(),
            target_workers: self.target_workers(),
            scaling_events: self.shared.scaling_events.load(Ordering::Relaxed),
            utilization: self.shared.utilization(),
        }
    }

    /// Enqueue a worker-count scaling request, keeping only the most recent
    /// one. No-op once the pool is stopping.
    pub(crate) fn request_worker_count(&self, target: i64) {
        if matches!(
            self.shared.stop_rx.try_recv(),
            Err(TryRecvError::Disconnected)
        ) {
            return;
        }

        // Drain any stale target so the one-slot inbox never blocks.
        let _ = self.scaling_rx.try_recv();

        select! {
            send(self.scaling_tx, target) -> _ => {},
            recv(self.shared.stop_rx) -> _ => {},
        }
    }

    /// Stop all workers and close the outcome channels. Blocks until every
    /// worker has exited.
    pub(crate) fn stop(&self) {
        debug!("stopping worker pool");

        // Closing the pool-wide stop channel makes every worker's select
        // (and the scaler's) fire.
        drop(self.stop_tx.lock().take());

        let wait_group = self.shared.wait_group.lock().take();
        if let Some(wg) = wait_group {
            wg.wait();
        }

        if let Some(handle) = self.scaler_handle.lock().take() {
            let _ = handle.join();
        }

        // The pool's copies were the last senders besides worker clones;
        // dropping them closes the result, error, and exec-time channels.
        drop(self.shared.outcomes.lock().take());

        debug!("worker pool stopped");
    }

    #[cfg(test)]
    fn adjust_for_test(&self, target: i64) {
        adjust_worker_count(&self.shared, target);
    }
}

impl PoolShared {
    /// `active / running`, zero when no workers are running.
    fn utilization(&self) -> f64 {
        let running = self.workers_running.load(Ordering::Relaxed);
        if running == 0 {
            return 0.0;
        }
        self.workers_active.load(Ordering::Relaxed) as f64 / running as f64
    }

    /// Worker ids partitioned into (busy, idle), each sorted by id.
    fn busy_and_idle_workers(&self) -> (Vec<WorkerId>, Vec<WorkerId>) {
        let workers = self.workers.lock();
        let mut busy = Vec::new();
        let mut idle = Vec::new();
        for (id, info) in workers.iter() {
            if info.busy.load(Ordering::Relaxed) {
                busy.push(*id);
            } else {
                idle.push(*id);
            }
        }
        busy.sort_unstable();
        idle.sort_unstable();
        (busy, idle)
    }
}

/// Spawn `n_workers` new workers into the pool.
fn add_workers(shared: &Arc<PoolShared>, n_workers: usize) {
    debug!(n_workers, "adding workers to the pool");

    let outcomes = match shared.outcomes.lock().clone() {
        Some(outcomes) => outcomes,
        None => {
            // Pool is stopping; nothing to spawn into.
            return;
        }
    };
    let wait_group = shared.wait_group.lock();
    let Some(wg) = wait_group.as_ref() else {
        return;
    };

    for _ in 0..n_workers {
        let id = WorkerId(shared.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let worker_shared = Arc::clone(shared);
        let worker_outcomes = outcomes.clone();
        let worker_wg = wg.clone();
        thread::Builder::new()
            .name(id.to_string())
            .spawn(move || worker_loop(&worker_shared, id, worker_outcomes, worker_wg))
            .expect("failed to spawn worker thread");
    }
}

/// Serializer for scaling requests: applies one target at a time until the
/// pool stops.
fn scaling_loop(shared: &Arc<PoolShared>, scaling_rx: &Receiver<i64>) {
    loop {
        select! {
            recv(scaling_rx) -> msg => match msg {
                Ok(target) => adjust_worker_count(shared, target),
                Err(_) => return,
            },
            recv(shared.stop_rx) -> _ => return,
        }
    }
}

/// Adjust the number of workers in the pool to match the target count.
///
/// Upscaling uses the target delta, which is updated synchronously, so a
/// burst of requests cannot overshoot while spawned workers are still
/// registering. Downscaling uses the running count, so a previously refused
/// downscale is retried once the debounce expires even when the requested
/// target has not changed.
fn adjust_worker_count(shared: &Arc<PoolShared>, new_target: i64) {
    shared.scaling_events.fetch_add(1, Ordering::Relaxed);
    let new_target = new_target.max(0);
    let current_target = shared.worker_count_target.swap(new_target, Ordering::Relaxed);
    let running = shared.workers_running.load(Ordering::Relaxed);

    if new_target > current_target {
        debug!(
            from = current_target,
            to = new_target,
            "scaling worker count up"
        );
        add_workers(shared, (new_target - current_target) as usize);
    } else if new_target < running {
        let utilization = shared.utilization();
        let since_last = shared.last_downscale.lock().elapsed();
        if utilization < shared.utilization_threshold && since_last >= shared.downscale_min_interval
        {
            debug!(from = running, to = new_target, "scaling worker count down");
            match stop_workers(shared, (running - new_target) as usize) {
                Ok(()) => *shared.last_downscale.lock() = Instant::now(),
                Err(err) => warn!(err = %err, "stopping workers failed"),
            }
        } else {
            debug!(
                utilization,
                since_last_secs = since_last.as_secs_f64(),
                "skipping down-scale"
            );
        }
    } else {
        debug!(target = new_target, "pool already at target worker count");
    }
}

/// Stop `workers_to_stop` workers, preferring idle ones. If idle workers are
/// insufficient, busy workers receive stop signals as well and exit after
/// their current task. Failures are joined into one message and logged by
/// the caller, never propagated further.
fn stop_workers(shared: &Arc<PoolShared>, workers_to_stop: usize) -> Result<(), String> {
    let running = shared.workers_running.load(Ordering::Relaxed);
    if workers_to_stop == 0 {
        return Err("invalid number of workers to stop: 0".into());
    }
    if workers_to_stop as i64 > running {
        return Err(format!(
            "cannot stop {workers_to_stop} out of {running} running workers"
        ));
    }
    debug!(workers_to_stop, "removing workers from the pool");

    let (busy, idle) = shared.busy_and_idle_workers();

    let mut failures = Vec::new();
    let mut stop_one = |worker_id: WorkerId| {
        let info = shared.workers.lock().get(&worker_id).cloned();
        match info {
            Some(info) => info.signal_stop(),
            None => failures.push(format!("{worker_id} not found")),
        }
    };

    if idle.len() >= workers_to_stop {
        for worker_id in &idle[..workers_to_stop] {
            stop_one(*worker_id);
        }
    } else {
        for worker_id in &idle {
            stop_one(*worker_id);
        }
        let remaining = (workers_to_stop - idle.len()).min(busy.len());
        for worker_id in &busy[..remaining] {
            stop_one(*worker_id);
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

/// Body of a worker thread: register, consume tasks until a stop signal or
/// channel closure, deregister.
fn worker_loop(
    shared: &Arc<PoolShared>,
    id: WorkerId,
    outcomes: OutcomeChannels,
    wait_group: WaitGroup,
) {
    debug!(worker = %id, "worker starting");

    let (own_stop_tx, own_stop_rx) = bounded::<()>(0);
    let info = Arc::new(WorkerInfo {
        id,
        busy: AtomicBool::new(false),
        stop_tx: Mutex::new(Some(own_stop_tx)),
    });
    shared.workers_running.fetch_add(1, Ordering::Relaxed);
    shared.workers.lock().insert(id, Arc::clone(&info));

    loop {
        select! {
            recv(shared.task_rx) -> msg => match msg {
                Ok(task) => execute_task(shared, &info, &outcomes, task.as_ref()),
                Err(_) => {
                    debug!(worker = %id, "task channel closed, exiting");
                    break;
                }
            },
            recv(own_stop_rx) -> _ => {
                debug!(worker = %id, "received targeted stop signal, exiting");
                break;
            },
            recv(shared.stop_rx) -> _ => {
                debug!(worker = %id, "received pool stop signal, exiting");
                break;
            },
        }
    }

    shared.workers.lock().remove(&id);
    shared.workers_running.fetch_sub(1, Ordering::Relaxed);
    drop(wait_group);
}

/// Run one task in a panic-safe frame and route its outcome.
///
/// Errors and execution times are offered non-blockingly: a congested
/// channel drops the sample rather than stalling the worker.
fn execute_task(
    shared: &Arc<PoolShared>,
    info: &WorkerInfo,
    outcomes: &OutcomeChannels,
    task: &dyn Task,
) {
    trace!(worker = %info.id, "executing task");
    info.busy.store(true, Ordering::Relaxed);
    shared.workers_active.fetch_add(1, Ordering::Relaxed);

    let start = Instant::now();
    let frame = panic::catch_unwind(AssertUnwindSafe(|| task.execute()));

    match frame {
        Ok(result) => {
            if let Err(task_err) = &result {
                // No retry policy; surface the error and move on.
                let _ = outcomes.error_tx.try_send(task_err.clone());
            }
            if outcomes.result_tx.try_send(result).is_err() {
                trace!(worker = %info.id, "result channel congested, dropping result");
            }
            let _ = outcomes.exec_time_tx.try_send(start.elapsed());
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(worker = %info.id, message = %message, "task panicked");
            let task_err = TaskError::Panic {
                worker: info.id,
                message,
            };
            let _ = outcomes.error_tx.try_send(task_err.clone());
            let _ = outcomes.result_tx.try_send(Err(task_err));
        }
    }

    info.busy.store(false, Ordering::Relaxed);
    shared.workers_active.fetch_sub(1, Ordering::Relaxed);
    trace!(worker = %info.id, "finished task");
}

/// Render a panic payload as text.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::FnTask;
    use std::sync::atomic::AtomicUsize;

    struct Channels {
        task_tx: Sender<Arc<dyn Task>>,
        result_rx: Receiver<TaskResult>,
        error_rx: Receiver<TaskError>,
        exec_time_rx: Receiver<Duration>,
    }

    fn make_pool(worker_count: usize) -> (WorkerPool, Channels) {
        make_pool_with_debounce(worker_count, Duration::from_secs(30))
    }

    fn make_pool_with_debounce(
        worker_count: usize,
        downscale_min_interval: Duration,
    ) -> (WorkerPool, Channels) {
        let (task_tx, task_rx) = bounded::<Arc<dyn Task>>(4);
        let (result_tx, result_rx) = bounded(16);
        let (error_tx, error_rx) = bounded(16);
        let (exec_time_tx, exec_time_rx) = bounded(16);
        let pool = WorkerPool::new(
            worker_count,
            0.4,
            downscale_min_interval,
            task_rx,
            result_tx,
            error_tx,
            exec_time_tx,
        );
        (
            pool,
            Channels {
                task_tx,
                result_rx,
                error_rx,
                exec_time_rx,
            },
        )
    }

    fn wait_for<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_workers_start_and_stop() {
        let (pool, _channels) = make_pool(4);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 4));
        assert_eq!(pool.active_workers(), 0);
        assert_eq!(pool.target_workers(), 4);

        pool.stop();
        assert_eq!(pool.running_workers(), 0);
        assert_eq!(pool.active_workers(), 0);
    }

    #[test]
    fn test_task_execution_and_exec_time_sample() {
        let (pool, channels) = make_pool(1);
        let executions = Arc::new(AtomicUsize::new(0));
        let task_executions = Arc::clone(&executions);

        let task: Arc<dyn Task> = Arc::new(FnTask::new(move || {
            task_executions.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            Ok(None)
        }));
        channels.task_tx.send(task).unwrap();

        let result = channels
            .result_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        let sample = channels
            .exec_time_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert!(sample >= Duration::from_millis(10));

        pool.stop();
    }

    #[test]
    fn test_execution_error_reaches_error_channel() {
        let (pool, channels) = make_pool(1);

        let task: Arc<dyn Task> = Arc::new(FnTask::new(|| Err(TaskError::failed("test error"))));
        channels.task_tx.send(task).unwrap();

        let err = channels
            .error_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(err, TaskError::failed("test error"));

        let result = channels
            .result_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(result, Err(TaskError::failed("test error")));

        pool.stop();
    }

    #[test]
    fn test_panic_is_contained_and_worker_survives() {
        let (pool, channels) = make_pool(1);

        let task: Arc<dyn Task> = Arc::new(FnTask::new(|| panic!("task exploded")));
        channels.task_tx.send(task).unwrap();

        let err = channels
            .error_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        match err {
            TaskError::Panic { message, .. } => assert_eq!(message, "task exploded"),
            other => panic!("expected panic error, got {other:?}"),
        }

        // The worker is still alive and takes the next task.
        let task: Arc<dyn Task> = Arc::new(FnTask::new(|| Ok(None)));
        channels.task_tx.send(task).unwrap();
        let result = channels
            .result_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(pool.running_workers(), 1);

        pool.stop();
    }

    #[test]
    fn test_scale_up_spawns_delta() {
        let (pool, _channels) = make_pool(2);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 2));

        pool.request_worker_count(5);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 5));
        assert_eq!(pool.target_workers(), 5);

        pool.stop();
    }

    #[test]
    fn test_downscale_debounce_refuses_early_request() {
        let (pool, _channels) = make_pool(4);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 4));

        // Debounce interval has not elapsed since pool start.
        pool.request_worker_count(1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.running_workers(), 4);
        assert_eq!(pool.target_workers(), 1);

        pool.stop();
    }

    #[test]
    fn test_downscale_stops_idle_workers() {
        let (pool, _channels) = make_pool_with_debounce(4, Duration::ZERO);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 4));

        pool.adjust_for_test(1);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 1));

        pool.stop();
    }

    #[test]
    fn test_downscale_refused_under_high_utilization() {
        let (pool, channels) = make_pool_with_debounce(2, Duration::ZERO);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 2));

        // Occupy both workers.
        for _ in 0..2 {
            let task: Arc<dyn Task> = Arc::new(FnTask::new(|| {
                thread::sleep(Duration::from_millis(200));
                Ok(None)
            }));
            channels.task_tx.send(task).unwrap();
        }
        assert!(wait_for(Duration::from_secs(1), || pool.active_workers() == 2));

        pool.adjust_for_test(1);
        assert_eq!(pool.running_workers(), 2);

        pool.stop();
    }

    #[test]
    fn test_scaling_inbox_keeps_latest_request() {
        let (pool, _channels) = make_pool(1);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 1));

        pool.request_worker_count(2);
        pool.request_worker_count(6);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() >= 5));

        pool.stop();
    }

    #[test]
    fn test_targeted_stop_is_idempotent() {
        let (pool, _channels) = make_pool(1);
        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 1));

        let info = pool
            .shared
            .workers
            .lock()
            .values()
            .next()
            .cloned()
            .unwrap();
        info.signal_stop();
        info.signal_stop();

        assert!(wait_for(Duration::from_secs(1), || pool.running_workers() == 0));
        pool.stop();
    }

    #[test]
    fn test_stop_closes_outcome_channels() {
        let (pool, channels) = make_pool(2);
        pool.stop();

        assert!(channels.result_rx.recv().is_err());
        assert!(channels.error_rx.recv().is_err());
        assert!(channels.exec_time_rx.recv().is_err());
    }
}
