use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Query controller resource limits.
///
/// The controller admits at most `concurrency_quota` running queries,
/// queues at most `queue_size` more, and bounds memory both per query and
/// process-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum queries in the running state.
    pub concurrency_quota: usize,
    /// Maximum queries in the queued state; submissions beyond this are
    /// rejected immediately.
    pub queue_size: usize,
    /// Bytes reserved for a query up front on admission.
    pub initial_memory_bytes_quota_per_query: u64,
    /// Hard memory ceiling any single query may reach.
    pub memory_bytes_quota_per_query: u64,
    /// Process-wide memory ceiling across all running queries. `None`
    /// derives `concurrency_quota * memory_bytes_quota_per_query`.
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

impl ControllerConfig {
    /// The configured or derived process-wide memory ceiling.
    pub fn effective_max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
            .unwrap_or_else(|| (self.concurrency_quota as u64).saturating_mul(self.memory_bytes_quota_per_query))
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency_quota: 10,
            queue_size: 10,
            initial_memory_bytes_quota_per_query: 1024 * 1024, // 1MiB
            memory_bytes_quota_per_query: 64 * 1024 * 1024,    // 64MiB
            max_memory_bytes: None,
        }
    }
}

/// Task scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Size of the bounded pool consuming fired task instances.
    pub workers: usize,
    /// Oldest fire replayed during catch-up after downtime; anything older
    /// is dropped to bound recovery cost.
    pub max_catchup: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            max_catchup: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Task executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Run deadline as a multiple of the task's schedule period; the run
    /// fails with `deadline exceeded` once `scheduled_for + period * this`
    /// passes.
    pub run_deadline_multiplier: f64,
    /// Advance `latest_completed` on failed runs too, so one poisoned fire
    /// cannot wedge the task.
    #[serde(default)]
    pub record_failures: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_deadline_multiplier: 1.0,
            record_failures: false,
        }
    }
}

/// Top-level composition configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Query controller limits.
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Task scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Task executor tuning.
    #[serde(default)]
    pub executor: ExecutorConfig,
}
