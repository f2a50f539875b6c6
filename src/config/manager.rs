//! Manager and scaling-policy configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of workers: the CPU count.
fn default_worker_count() -> usize {
    num_cpus::get()
}

/// Default task channel buffer.
fn default_task_buffer_size() -> usize {
    64
}

/// Default buffer for the result, error, and execution-time channels.
fn default_result_buffer_size() -> usize {
    64
}

fn default_scaling() -> ScalingConfig {
    ScalingConfig::default()
}

fn default_enabled() -> bool {
    true
}

/// Default autoscaler evaluation interval: 5 seconds.
fn default_autoscale_interval_ms() -> u64 {
    5_000
}

/// Default pool utilization at or above which downscaling is refused.
fn default_utilization_threshold() -> f64 {
    0.4
}

/// Default minimum interval between downscaling events: 30 seconds.
fn default_downscale_min_interval_secs() -> u64 {
    30
}

/// Default headroom multiplier applied to the steady-state demand estimate.
fn default_headroom() -> f64 {
    2.0
}

fn default_min_workers() -> usize {
    1
}

/// Configuration for the task manager.
///
/// # Example
///
/// ```rust
/// use taskmill::ManagerConfig;
///
/// let config = ManagerConfig::new()
///     .with_worker_count(8)
///     .with_task_buffer_size(128)
///     .with_result_buffer_size(128);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Number of workers spawned at start.
    ///
    /// Default: `num_cpus::get()`.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Buffer of the shared task channel. A full task channel backpressures
    /// the scheduling loop.
    #[serde(default = "default_task_buffer_size")]
    pub task_buffer_size: usize,

    /// Buffer of the result channel, shared by the error and execution-time
    /// channels. Congestion on those drops samples rather than stalling
    /// workers.
    #[serde(default = "default_result_buffer_size")]
    pub result_buffer_size: usize,

    /// Worker-count scaling policy.
    #[serde(default = "default_scaling")]
    pub scaling: ScalingConfig,
}

/// Configuration for the autoscaler and the pool's downscale policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Whether the autoscaler loop runs at all. The pool's scaling inbox
    /// accepts manual targets either way.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Interval between autoscaler evaluations, in milliseconds.
    #[serde(default = "default_autoscale_interval_ms")]
    pub autoscale_interval_ms: u64,

    /// Pool utilization at or above which a downscale request is refused.
    #[serde(default = "default_utilization_threshold")]
    pub utilization_threshold: f64,

    /// Minimum interval between downscaling events, in seconds.
    #[serde(default = "default_downscale_min_interval_secs")]
    pub downscale_min_interval_secs: u64,

    /// Multiplier applied to the steady-state concurrency demand so the
    /// pool keeps slack for bursts.
    #[serde(default = "default_headroom")]
    pub headroom: f64,

    /// Lower bound for the autoscaler's target.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Upper bound for the autoscaler's target. Zero means four times the
    /// configured worker count.
    #[serde(default)]
    pub max_workers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            task_buffer_size: default_task_buffer_size(),
            result_buffer_size: default_result_buffer_size(),
            scaling: ScalingConfig::default(),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            autoscale_interval_ms: default_autoscale_interval_ms(),
            utilization_threshold: default_utilization_threshold(),
            downscale_min_interval_secs: default_downscale_min_interval_secs(),
            headroom: default_headroom(),
            min_workers: default_min_workers(),
            max_workers: 0,
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers spawned at start.
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the task channel buffer.
    #[must_use]
    pub fn with_task_buffer_size(mut self, size: usize) -> Self {
        self.task_buffer_size = size;
        self
    }

    /// Set the result/error/execution-time channel buffer.
    #[must_use]
    pub fn with_result_buffer_size(mut self, size: usize) -> Self {
        self.result_buffer_size = size;
        self
    }

    /// Set the scaling policy.
    #[must_use]
    pub fn with_scaling(mut self, scaling: ScalingConfig) -> Self {
        self.scaling = scaling;
        self
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.task_buffer_size == 0 {
            return Err("task_buffer_size must be greater than 0".into());
        }
        if self.result_buffer_size == 0 {
            return Err("result_buffer_size must be greater than 0".into());
        }
        self.scaling.validate()
    }

    /// Parse a manager configuration from a JSON string and validate it.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: ManagerConfig =
            serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

impl ScalingConfig {
    /// Create a new scaling configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the autoscaler loop.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the autoscaler evaluation interval in milliseconds.
    #[must_use]
    pub fn with_autoscale_interval_ms(mut self, interval_ms: u64) -> Self {
        self.autoscale_interval_ms = interval_ms;
        self
    }

    /// Set the utilization threshold above which downscaling is refused.
    #[must_use]
    pub fn with_utilization_threshold(mut self, threshold: f64) -> Self {
        self.utilization_threshold = threshold;
        self
    }

    /// Set the minimum interval between downscaling events in seconds.
    #[must_use]
    pub fn with_downscale_min_interval_secs(mut self, secs: u64) -> Self {
        self.downscale_min_interval_secs = secs;
        self
    }

    /// Set the target bounds.
    #[must_use]
    pub fn with_worker_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    /// The autoscaler evaluation interval as a `Duration`.
    #[must_use]
    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_millis(self.autoscale_interval_ms)
    }

    /// The downscale debounce interval as a `Duration`.
    #[must_use]
    pub fn downscale_min_interval(&self) -> Duration {
        Duration::from_secs(self.downscale_min_interval_secs)
    }

    /// Upper bound for scaling targets, given the configured worker count.
    #[must_use]
    pub fn resolved_max_workers(&self, worker_count: usize) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            worker_count.saturating_mul(4).max(self.min_workers)
        }
    }

    /// Validate the scaling policy values.
    pub fn validate(&self) -> Result<(), String> {
        if self.autoscale_interval_ms == 0 {
            return Err("autoscale_interval_ms must be greater than 0".into());
        }
        if !(self.utilization_threshold > 0.0 && self.utilization_threshold <= 1.0) {
            return Err("utilization_threshold must be in (0, 1]".into());
        }
        if self.headroom <= 0.0 {
            return Err("headroom must be greater than 0".into());
        }
        if self.min_workers == 0 {
            return Err("min_workers must be greater than 0".into());
        }
        if self.max_workers > 0 && self.max_workers < self.min_workers {
            return Err("max_workers must not be less than min_workers".into());
        }
        Ok(())
    }
}
