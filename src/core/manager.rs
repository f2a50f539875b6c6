//! The task manager: admission API, the scheduling run loop, and lifecycle.
//!
//! Admission and the run loop share one mutex over the job queue; the mutex
//! is never held across a channel send. Admission signals the run loop
//! through a one-slot wakeup channel whose sends coalesce: if a wake is
//! already pending, the new one is dropped. The run loop sleeps until the
//! earliest deadline, dispatches every task of the due job onto the task
//! channel (blocking, cancelled by stop), advances the deadline by the
//! job's cadence, and reinserts it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use parking_lot::{Mutex, Once};
use tracing::{debug, trace, warn};

use crate::config::ManagerConfig;
use crate::core::autoscaler::autoscale_loop;
use crate::core::error::{ManagerError, TaskError};
use crate::core::metrics::{ManagerMetrics, MetricsSnapshot};
use crate::core::queue::{JobQueue, ScheduledJob};
use crate::core::task::{FnTask, Job, Task, TaskResult};
use crate::core::worker_pool::{PoolStatus, WorkerPool};
use crate::util::ids::generate_job_id;

/// Job queue plus the stopped flag, observed together under one mutex.
struct QueueState {
    queue: JobQueue,
    stopped: bool,
}

/// State shared between the manager handle and the run loop.
struct ManagerShared {
    state: Mutex<QueueState>,
    wakeup_rx: Receiver<()>,
    stop_rx: Receiver<()>,
}

/// Internal error drainer, alive until ownership of the error channel is
/// transferred or the manager stops.
struct ErrorDrainer {
    handoff_tx: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl ErrorDrainer {
    /// Signal the drainer and wait for it to exit.
    fn shut_down(self) {
        drop(self.handoff_tx);
        let _ = self.handle.join();
    }
}

/// Manages periodic jobs, dispatching their tasks to a worker pool at each
/// job's cadence.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use taskmill::{TaskManager, TaskResult};
///
/// let manager = TaskManager::new(4, 16, 16).unwrap();
/// let job_id = manager
///     .schedule_func(|| -> TaskResult { Ok(None) }, Duration::from_secs(30))
///     .unwrap();
///
/// manager.remove_job(&job_id).unwrap();
/// manager.stop();
/// ```
pub struct TaskManager {
    shared: Arc<ManagerShared>,
    pool: Arc<WorkerPool>,
    metrics: Arc<ManagerMetrics>,

    wakeup_tx: Sender<()>,
    stop_tx: Mutex<Option<Sender<()>>>,
    task_tx: Mutex<Option<Sender<Arc<dyn Task>>>>,

    result_rx: Receiver<TaskResult>,
    error_rx: Receiver<TaskError>,
    error_transferred: AtomicBool,
    error_drainer: Mutex<Option<ErrorDrainer>>,

    run_handle: Mutex<Option<thread::JoinHandle<()>>>,
    metrics_handle: Mutex<Option<thread::JoinHandle<()>>>,
    autoscaler_handle: Mutex<Option<thread::JoinHandle<()>>>,

    stop_once: Once,
}

impl TaskManager {
    /// Create and start a manager with `worker_count` workers and the given
    /// channel buffers. All three must be at least 1.
    pub fn new(
        worker_count: usize,
        task_buffer_size: usize,
        result_buffer_size: usize,
    ) -> Result<Self, ManagerError> {
        Self::with_config(
            ManagerConfig::new()
                .with_worker_count(worker_count)
                .with_task_buffer_size(task_buffer_size)
                .with_result_buffer_size(result_buffer_size),
        )
    }

    /// Create and start a manager from a full configuration.
    pub fn with_config(config: ManagerConfig) -> Result<Self, ManagerError> {
        config.validate().map_err(ManagerError::InvalidConfig)?;
        debug!(
            worker_count = config.worker_count,
            task_buffer_size = config.task_buffer_size,
            result_buffer_size = config.result_buffer_size,
            "creating task manager"
        );

        let (task_tx, task_rx) = bounded::<Arc<dyn Task>>(config.task_buffer_size);
        let (result_tx, result_rx) = bounded::<TaskResult>(config.result_buffer_size);
        let (error_tx, error_rx) = bounded::<TaskError>(config.result_buffer_size);
        let (exec_time_tx, exec_time_rx) = bounded::<Duration>(config.result_buffer_size);
        let (wakeup_tx, wakeup_rx) = bounded::<()>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let pool = Arc::new(WorkerPool::new(
            config.worker_count,
            config.scaling.utilization_threshold,
            config.scaling.downscale_min_interval(),
            task_rx,
            result_tx,
            error_tx,
            exec_time_tx,
        ));

        let metrics = Arc::new(ManagerMetrics::default());

        let shared = Arc::new(ManagerShared {
            state: Mutex::new(QueueState {
                queue: JobQueue::new(),
                stopped: false,
            }),
            wakeup_rx,
            stop_rx: stop_rx.clone(),
        });

        let run_shared = Arc::clone(&shared);
        let run_task_tx = task_tx.clone();
        let run_handle = thread::Builder::new()
            .name("taskmill-run".into())
            .spawn(move || run_loop(&run_shared, &run_task_tx))
            .expect("failed to spawn run loop thread");

        let metrics_consumer = Arc::clone(&metrics);
        let metrics_stop_rx = stop_rx.clone();
        let metrics_handle = thread::Builder::new()
            .name("taskmill-metrics".into())
            .spawn(move || metrics_consumer.consume_exec_times(&exec_time_rx, &metrics_stop_rx))
            .expect("failed to spawn metrics thread");

        let (handoff_tx, handoff_rx) = bounded::<()>(0);
        let drain_rx = error_rx.clone();
        let drain_handle = thread::Builder::new()
            .name("taskmill-errors".into())
            .spawn(move || drain_errors(&drain_rx, &handoff_rx))
            .expect("failed to spawn error drainer thread");

        let autoscaler_handle = if config.scaling.enabled {
            let as_metrics = Arc::clone(&metrics);
            let as_pool = Arc::clone(&pool);
            let as_config = config.scaling.clone();
            let as_worker_count = config.worker_count;
            let as_stop_rx = stop_rx;
            let handle = thread::Builder::new()
                .name("taskmill-autoscaler".into())
                .spawn(move || {
                    autoscale_loop(&as_metrics, &as_pool, &as_config, as_worker_count, &as_stop_rx);
                })
                .expect("failed to spawn autoscaler thread");
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            shared,
            pool,
            metrics,
            wakeup_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            task_tx: Mutex::new(Some(task_tx)),
            result_rx,
            error_rx,
            error_transferred: AtomicBool::new(false),
            error_drainer: Mutex::new(Some(ErrorDrainer {
                handoff_tx,
                handle: drain_handle,
            })),
            run_handle: Mutex::new(Some(run_handle)),
            metrics_handle: Mutex::new(Some(metrics_handle)),
            autoscaler_handle: Mutex::new(autoscaler_handle),
            stop_once: Once::new(),
        })
    }

    /// Schedule a single task at the given cadence. Returns the generated
    /// job id.
    pub fn schedule_task<T>(&self, task: T, cadence: Duration) -> Result<String, ManagerError>
    where
        T: Task + 'static,
    {
        self.schedule_tasks(vec![Arc::new(task) as Arc<dyn Task>], cadence)
    }

    /// Schedule a group of tasks as one job at the given cadence. The tasks
    /// fire together, first at now plus cadence. Returns the generated job
    /// id.
    pub fn schedule_tasks(
        &self,
        tasks: Vec<Arc<dyn Task>>,
        cadence: Duration,
    ) -> Result<String, ManagerError> {
        let job_id = generate_job_id();
        debug!(
            job_id = %job_id,
            n_tasks = tasks.len(),
            cadence_ms = cadence.as_millis() as u64,
            "scheduling job"
        );
        let job = Job {
            id: job_id.clone(),
            cadence,
            next_exec: Some(Instant::now() + cadence),
            tasks,
        };
        self.admit(job)?;
        Ok(job_id)
    }

    /// Schedule a closure as a task at the given cadence. Returns the
    /// generated job id.
    pub fn schedule_func<F>(&self, function: F, cadence: Duration) -> Result<String, ManagerError>
    where
        F: Fn() -> TaskResult + Send + Sync + 'static,
    {
        self.schedule_task(FnTask::new(function), cadence)
    }

    /// Schedule a fully-formed job with a caller-chosen id and first
    /// execution time.
    pub fn schedule_job(&self, job: Job) -> Result<(), ManagerError> {
        debug!(job_id = %job.id, n_tasks = job.tasks.len(), "scheduling job");
        self.admit(job)
    }

    /// Remove a job from the queue by id.
    pub fn remove_job(&self, job_id: &str) -> Result<(), ManagerError> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(ManagerError::Stopped);
        }
        match state.queue.position_of(job_id) {
            Some(pos) => {
                debug!(job_id, "removing job");
                let removed = state.queue.remove_at(pos);
                self.metrics
                    .update_task_metrics(-(removed.tasks.len() as i64), removed.cadence);
                Ok(())
            }
            None => {
                warn!(job_id, "job not found, no job was removed");
                Err(ManagerError::JobNotFound(job_id.to_owned()))
            }
        }
    }

    /// Replace the queued job sharing `job.id`, keeping its queue slot: the
    /// existing position and next execution time are preserved, while the
    /// cadence and tasks of the replacement are adopted. The new cadence
    /// takes effect at the next reschedule.
    pub fn replace_job(&self, job: Job) -> Result<(), ManagerError> {
        let Job {
            id,
            cadence,
            tasks,
            ..
        } = job;
        if cadence.is_zero() {
            return Err(ManagerError::InvalidCadence);
        }
        if tasks.is_empty() {
            return Err(ManagerError::NoTasks);
        }

        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(ManagerError::Stopped);
        }
        let Some(pos) = state.queue.position_of(&id) else {
            return Err(ManagerError::JobNotFound(id));
        };
        debug!(job_id = %id, "replacing job");

        let entry = state.queue.job_mut(pos);
        let old_width = entry.tasks.len() as i64;
        let old_cadence = entry.cadence;
        entry.cadence = cadence;
        entry.tasks = tasks;
        let new_width = entry.tasks.len() as i64;
        state.queue.update_at(pos);

        self.metrics.update_task_metrics(-old_width, old_cadence);
        self.metrics.update_task_metrics(new_width, cadence);
        Ok(())
    }

    /// Number of jobs currently in the queue.
    pub fn job_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Snapshot of the manager metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Snapshot of the worker pool counters.
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Request a new worker-count target from the pool. Only the most
    /// recent request is kept; downscales are subject to the pool's
    /// utilization and debounce policy.
    pub fn request_worker_count(&self, target: usize) {
        self.pool.request_worker_count(target as i64);
    }

    /// Take ownership of the error channel.
    ///
    /// Before the first call, execution errors are drained and logged
    /// internally. After it, every error flows to the returned receiver.
    /// Ownership transfers at most once; a second call fails.
    pub fn error_channel(&self) -> Result<Receiver<TaskError>, ManagerError> {
        if self.error_transferred.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::ErrorChannelTaken);
        }
        if let Some(drainer) = self.error_drainer.lock().take() {
            drainer.shut_down();
        }
        debug!("error channel ownership transferred");
        Ok(self.error_rx.clone())
    }

    /// A receiver of task results. The channel is closed by the pool during
    /// stop. Congestion drops results rather than stalling workers; size
    /// `result_buffer_size` accordingly.
    pub fn results(&self) -> Receiver<TaskResult> {
        self.result_rx.clone()
    }

    /// Stop the manager: no further admissions succeed, the run loop and
    /// all workers terminate, and the owned channels close. Blocks until
    /// shutdown is complete. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stop_once.call_once(|| {
            debug!("stopping task manager");

            self.shared.state.lock().stopped = true;

            // Closing the stop token cancels the run loop, the metrics
            // consumer, and the autoscaler.
            drop(self.stop_tx.lock().take());

            // Workers must stop consuming before the task channel closes.
            self.pool.stop();

            if let Some(handle) = self.run_handle.lock().take() {
                let _ = handle.join();
            }
            if let Some(handle) = self.metrics_handle.lock().take() {
                let _ = handle.join();
            }
            if let Some(handle) = self.autoscaler_handle.lock().take() {
                let _ = handle.join();
            }
            if let Some(drainer) = self.error_drainer.lock().take() {
                drainer.shut_down();
            }

            // The run loop has exited; dropping the last sender closes the
            // task channel.
            drop(self.task_tx.lock().take());

            debug!("task manager stopped");
        });
    }

    /// Validate and insert a job under the queue mutex, then wake the run
    /// loop.
    fn admit(&self, job: Job) -> Result<(), ManagerError> {
        let Job {
            id,
            cadence,
            next_exec,
            tasks,
        } = job;

        let mut state = self.shared.state.lock();
        if state.stopped {
            debug!(job_id = %id, "manager is stopped, not adding job");
            return Err(ManagerError::Stopped);
        }
        if cadence.is_zero() {
            return Err(ManagerError::InvalidCadence);
        }
        if tasks.is_empty() {
            return Err(ManagerError::NoTasks);
        }
        let Some(next_exec) = next_exec else {
            return Err(ManagerError::ZeroNextExec);
        };
        if state.queue.contains(&id) {
            return Err(ManagerError::DuplicateJobId(id));
        }

        let width = tasks.len() as i64;
        state.queue.push(ScheduledJob::new(id, cadence, next_exec, tasks));
        self.metrics.update_task_metrics(width, cadence);
        drop(state);

        // Coalescing wakeup: drop the signal if one is already pending.
        let _ = self.wakeup_tx.try_send(());
        Ok(())
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The scheduling loop: sleep until the earliest deadline, dispatch the due
/// job's tasks in declared order, reschedule additively, repeat.
fn run_loop(shared: &Arc<ManagerShared>, task_tx: &Sender<Arc<dyn Task>>) {
    debug!("run loop started");
    loop {
        let mut state = shared.state.lock();

        if state.queue.is_empty() {
            drop(state);
            select! {
                recv(shared.wakeup_rx) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                    trace!("woken for newly admitted job");
                },
                recv(shared.stop_rx) -> _ => {
                    debug!("run loop received stop signal, exiting");
                    return;
                },
            }
            continue;
        }

        let now = Instant::now();
        let Some(next_exec) = state.queue.peek().map(|top| top.next_exec) else {
            continue;
        };

        if next_exec <= now {
            let Some(mut job) = state.queue.pop() else {
                continue;
            };
            drop(state);

            debug!(job_id = %job.id, "dispatching job");
            for task in &job.tasks {
                select! {
                    send(task_tx, Arc::clone(task)) -> sent => {
                        if sent.is_err() {
                            return;
                        }
                    },
                    recv(shared.stop_rx) -> _ => {
                        debug!("run loop received stop during dispatch, exiting");
                        return;
                    },
                }
            }

            // Additive reschedule: the next deadline advances by the
            // cadence from the previous deadline, not from now, so a late
            // dispatch does not shift the job's phase.
            job.next_exec += job.cadence;
            shared.state.lock().queue.push(job);
            continue;
        }

        let delay = next_exec - now;
        drop(state);
        select! {
            recv(after(delay)) -> _ => {},
            recv(shared.wakeup_rx) -> msg => {
                if msg.is_err() {
                    return;
                }
                trace!("woken during deadline wait");
            },
            recv(shared.stop_rx) -> _ => {
                debug!("run loop received stop during wait, exiting");
                return;
            },
        }
    }
}

/// Log execution errors until ownership of the error channel transfers or
/// the channel closes.
fn drain_errors(error_rx: &Receiver<TaskError>, handoff_rx: &Receiver<()>) {
    loop {
        select! {
            recv(error_rx) -> msg => match msg {
                Ok(err) => warn!(%err, "task execution error"),
                Err(_) => return,
            },
            recv(handoff_rx) -> _ => {
                trace!("error drainer handing off");
                return;
            },
        }
    }
}
