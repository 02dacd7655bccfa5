//! Autoscaled pool configuration and task seams

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::memory::MemoryProbe;
use crate::system_events::SystemEventBus;

/// A single unit of user work. Its failure aborts the whole run.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Produces the next task to run, or `None` when no task is currently ready.
pub type RunTaskFn = Arc<dyn Fn() -> Option<TaskFuture> + Send + Sync>;

/// Async predicate consulted by the pool. Errors are logged and non-fatal.
pub type PredicateFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Tuning knobs for [`AutoscaledPool`](super::AutoscaledPool).
#[derive(Debug, Clone)]
pub struct AutoscaledPoolConfig {
    /// Hard cap on parallel tasks (default: 1000).
    pub max_concurrency: usize,
    /// Floor and initial concurrency (default: 1). Clamped to
    /// `max_concurrency` when larger.
    pub min_concurrency: usize,
    /// Cap applied to the probe's reported total memory, in megabytes.
    pub max_memory_mbytes: Option<u64>,
    /// Scale down when the recent mean free/total ratio drops below this
    /// (default: 0.2).
    pub min_free_memory_ratio: f64,
    /// Safety-net period at which the task driver is re-run even without a
    /// completion to trigger it (default: 500 ms).
    pub maybe_run_interval: Duration,
}

impl Default for AutoscaledPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1000,
            min_concurrency: 1,
            max_memory_mbytes: None,
            min_free_memory_ratio: 0.2,
            maybe_run_interval: Duration::from_millis(500),
        }
    }
}

/// Everything an [`AutoscaledPool`](super::AutoscaledPool) is built from.
pub struct AutoscaledPoolOptions {
    pub config: AutoscaledPoolConfig,
    /// Source of tasks.
    pub run_task: RunTaskFn,
    /// Gate consulted before asking for a task. Defaults to always ready.
    pub is_task_ready: Option<PredicateFn>,
    /// When present, the pool only completes once this returns true with no
    /// tasks running. When absent, the pool completes as soon as it idles.
    pub is_finished: Option<PredicateFn>,
    /// Memory observations driving the autoscaler.
    pub memory_probe: Arc<dyn MemoryProbe>,
    /// Source of CPU overload samples.
    pub cpu_bus: Arc<SystemEventBus>,
}
