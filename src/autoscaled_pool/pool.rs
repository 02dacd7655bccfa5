//! Adaptive task scheduler
//!
//! Launches user-supplied tasks in parallel and continuously resizes the
//! permitted concurrency from memory and CPU load signals, keeping the host
//! loaded but not overloaded. Scaling state is sampled on a fixed tick; task
//! starts are driven by completions plus a safety-net timer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::config::{AutoscaledPoolConfig, AutoscaledPoolOptions, PredicateFn, RunTaskFn};
use super::history::SampleRing;
use crate::memory::MemoryProbe;
use crate::system_events::SystemEvent;

/// Period of the memory sampling tick.
const MEM_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);
/// Scale-up is considered every this many ticks (10 s at the tick period).
const SCALE_UP_INTERVAL: usize = 50;
/// Largest single scale-up step.
const SCALE_UP_MAX_STEP: usize = 10;
/// Scale-down is considered every this many ticks (1 s at the tick period).
const SCALE_DOWN_INTERVAL: usize = 5;
/// A state snapshot is logged every this many ticks.
const LOG_INFO_INTERVAL: u64 = 6 * SCALE_UP_INTERVAL as u64;
/// Hard floor of the free-memory ratio used when estimating headroom.
const MIN_FREE_MEMORY_RATIO: f64 = 0.1;

struct ScalingState {
    /// Recent free-memory samples, one per tick.
    free_bytes_history: SampleRing<u64>,
    /// Recent CPU overload reports from the system bus.
    cpu_overloaded_history: SampleRing<bool>,
    /// Ticks since the run started.
    tick_counter: u64,
    /// Total memory from the latest sample, already clamped by
    /// `max_memory_mbytes`.
    last_total_bytes: u64,
}

/// Adaptive scheduler for asynchronous tasks.
///
/// Built once, run once: [`run`](Self::run) resolves when the pool finishes
/// naturally and returns the first task error otherwise.
pub struct AutoscaledPool {
    config: AutoscaledPoolConfig,
    run_task: RunTaskFn,
    is_task_ready: Option<PredicateFn>,
    is_finished: Option<PredicateFn>,
    memory_probe: Arc<dyn MemoryProbe>,
    /// Subscription taken at construction, consumed by the listener task when
    /// the run starts.
    cpu_events: std::sync::Mutex<Option<broadcast::Receiver<SystemEvent>>>,
    concurrency: AtomicUsize,
    running_count: AtomicUsize,
    /// Guards so only one `is_task_ready` / `is_finished` query is ever
    /// outstanding.
    querying_is_task_ready: AtomicBool,
    querying_is_finished: AtomicBool,
    shutdown: AtomicBool,
    scaling: Mutex<ScalingState>,
    outcome: Mutex<Option<oneshot::Sender<Result<()>>>>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl AutoscaledPool {
    pub fn new(options: AutoscaledPoolOptions) -> Arc<Self> {
        let AutoscaledPoolOptions {
            config,
            run_task,
            is_task_ready,
            is_finished,
            memory_probe,
            cpu_bus,
        } = options;

        let initial_concurrency = config.min_concurrency.min(config.max_concurrency);
        // Seeded with one non-overloaded sample so scale-down cannot trigger
        // before the first real report arrives.
        let mut cpu_overloaded_history = SampleRing::new(SCALE_DOWN_INTERVAL);
        cpu_overloaded_history.push(false);

        let cpu_events = cpu_bus.subscribe();

        Arc::new_cyclic(|weak| Self {
            config,
            run_task,
            is_task_ready,
            is_finished,
            memory_probe,
            cpu_events: std::sync::Mutex::new(Some(cpu_events)),
            concurrency: AtomicUsize::new(initial_concurrency),
            running_count: AtomicUsize::new(0),
            querying_is_task_ready: AtomicBool::new(false),
            querying_is_finished: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            scaling: Mutex::new(ScalingState {
                free_bytes_history: SampleRing::new(SCALE_UP_INTERVAL),
                cpu_overloaded_history,
                tick_counter: 0,
                last_total_bytes: 0,
            }),
            outcome: Mutex::new(None),
            background: std::sync::Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        })
    }

    /// Current permitted parallelism.
    #[must_use]
    pub fn current_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    /// Tasks currently in flight.
    #[must_use]
    pub fn running_task_count(&self) -> usize {
        self.running_count.load(Ordering::SeqCst)
    }

    /// Run the pool to completion.
    ///
    /// Starts the sampling and safety-net timers, subscribes to the CPU bus,
    /// and drives the first task attempt. Resolves when the pool finishes
    /// naturally; returns the first task error otherwise. Either way all
    /// timers are cancelled and the CPU subscription is removed.
    pub async fn run(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut outcome = self.outcome.lock().await;
            if outcome.is_some() || self.shutdown.load(Ordering::SeqCst) {
                anyhow::bail!("pool was already run");
            }
            *outcome = Some(tx);
        }

        self.spawn_cpu_listener();
        self.spawn_autoscale_loop();
        self.spawn_task_driver_loop();
        self.maybe_run_task().await;

        let result = match rx.await {
            Ok(result) => result,
            // The sender only disappears if the pool is torn down externally.
            Err(_) => Ok(()),
        };
        self.teardown().await;
        result
    }

    fn spawn_cpu_listener(&self) {
        let Some(mut events) = self
            .cpu_events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let weak = self.weak_self.clone();
        self.push_background(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SystemEvent::CpuInfo(sample)) => {
                        let Some(pool) = weak.upgrade() else { break };
                        let mut scaling = pool.scaling.lock().await;
                        scaling.cpu_overloaded_history.push(sample.is_overloaded);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("CPU event stream lagged by {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn spawn_autoscale_loop(&self) {
        let weak = self.weak_self.clone();
        self.push_background(tokio::spawn(async move {
            let mut interval = tokio::time::interval(MEM_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.autoscale_tick().await;
            }
        }));
    }

    fn spawn_task_driver_loop(&self) {
        let weak = self.weak_self.clone();
        let period = self.config.maybe_run_interval;
        self.push_background(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.maybe_run_task().await;
            }
        }));
    }

    /// One sampling tick: record memory, then try to scale down and only if
    /// nothing changed, to scale up. A probe failure skips the tick; the loop
    /// itself never dies.
    async fn autoscale_tick(&self) {
        let snapshot = match self.memory_probe.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Memory probe failed, skipping autoscaling tick: {:#}", e);
                return;
            }
        };

        let mut total_bytes = snapshot.total_bytes;
        if let Some(cap_mbytes) = self.config.max_memory_mbytes {
            total_bytes = total_bytes.min(cap_mbytes * 1024 * 1024);
        }

        let mut scaling = self.scaling.lock().await;
        scaling.tick_counter += 1;
        scaling.free_bytes_history.push(snapshot.free_bytes);
        scaling.last_total_bytes = total_bytes;

        let scaled_down = self.maybe_scale_down(&scaling);
        if !scaled_down {
            self.maybe_scale_up(&scaling);
        }

        if scaling.tick_counter % LOG_INFO_INTERVAL == 0 {
            info!(
                concurrency = self.current_concurrency(),
                running = self.running_task_count(),
                free_bytes = snapshot.free_bytes,
                total_bytes,
                samples = scaling.free_bytes_history.len(),
                "Autoscaled pool state"
            );
        }
    }

    /// Drop concurrency by one when memory or CPU is overloaded. Returns
    /// whether concurrency changed.
    fn maybe_scale_down(&self, scaling: &ScalingState) -> bool {
        if scaling.tick_counter % SCALE_DOWN_INTERVAL as u64 != 0 {
            return false;
        }
        let concurrency = self.concurrency.load(Ordering::SeqCst);
        if concurrency <= self.config.min_concurrency {
            return false;
        }

        let memory_overloaded = match scaling.free_bytes_history.mean_of_last(SCALE_DOWN_INTERVAL) {
            Some(mean_free) if scaling.last_total_bytes > 0 => {
                mean_free / (scaling.last_total_bytes as f64) < self.config.min_free_memory_ratio
            }
            _ => false,
        };
        let cpu_overloaded = scaling.cpu_overloaded_history.all_true();
        if !memory_overloaded && !cpu_overloaded {
            return false;
        }

        let new_concurrency = concurrency - 1;
        self.concurrency.store(new_concurrency, Ordering::SeqCst);
        info!(
            old_concurrency = concurrency,
            new_concurrency,
            memory_overloaded,
            cpu_overloaded,
            "Scaling down"
        );
        true
    }

    /// Raise concurrency by the estimated memory headroom, at most
    /// `SCALE_UP_MAX_STEP` at a time.
    fn maybe_scale_up(&self, scaling: &ScalingState) {
        if scaling.tick_counter % SCALE_UP_INTERVAL as u64 != 0 {
            return;
        }
        let concurrency = self.concurrency.load(Ordering::SeqCst);
        if concurrency >= self.config.max_concurrency {
            return;
        }
        let Some(min_free_bytes) = scaling.free_bytes_history.min() else {
            return;
        };
        let total_bytes = scaling.last_total_bytes;
        if total_bytes == 0 {
            return;
        }

        let total = total_bytes as f64;
        let min_free_ratio = min_free_bytes as f64 / total;
        let max_taken_ratio = total_bytes.saturating_sub(min_free_bytes) as f64 / total;
        let running = self.running_count.load(Ordering::SeqCst).max(1);
        let per_instance_ratio = max_taken_ratio / running as f64;

        // With zero observed memory use the quotient is infinite; the cast
        // below saturates and the step cap takes over.
        let room = ((min_free_ratio - MIN_FREE_MEMORY_RATIO) / per_instance_ratio).floor();
        if room.is_nan() || room <= 0.0 {
            return;
        }

        let step = (room as usize).min(SCALE_UP_MAX_STEP);
        let new_concurrency = (concurrency + step).min(self.config.max_concurrency);
        self.concurrency.store(new_concurrency, Ordering::SeqCst);
        info!(
            old_concurrency = concurrency,
            new_concurrency, min_free_ratio, "Scaling up"
        );
    }

    /// Try to fill free concurrency slots with tasks.
    ///
    /// At most one invocation queries `is_task_ready` at a time; the loop
    /// replaces the recursive burst-fill of older schedulers and is bounded
    /// by `concurrency` through the running-count check.
    async fn maybe_run_task(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if self.running_count.load(Ordering::SeqCst) >= self.concurrency.load(Ordering::SeqCst)
            {
                return;
            }
            if self.querying_is_task_ready.swap(true, Ordering::SeqCst) {
                // Someone else is already querying; they will fill the slots.
                return;
            }

            let ready = match &self.is_task_ready {
                Some(predicate) => predicate().await,
                None => Ok(true),
            };
            self.querying_is_task_ready.store(false, Ordering::SeqCst);

            let ready = match ready {
                Ok(ready) => ready,
                Err(e) => {
                    // Non-fatal; the safety-net timer retries later.
                    warn!("is_task_ready failed: {:#}", e);
                    return;
                }
            };
            if !ready {
                self.maybe_finish().await;
                return;
            }

            let Some(task) = (self.run_task)() else {
                self.maybe_finish().await;
                return;
            };

            self.running_count.fetch_add(1, Ordering::SeqCst);
            let weak = self.weak_self.clone();
            tokio::spawn(async move {
                let result = task.await;
                let Some(pool) = weak.upgrade() else { return };
                pool.running_count.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok(()) => pool.drive().await,
                    Err(e) => pool.fail(e).await,
                }
            });
            // Loop on to fill the next slot.
        }
    }

    /// Boxed re-entry into the task driver, used from task completions.
    fn drive(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.maybe_run_task().await;
        })
    }

    /// Resolve the run once nothing is running and the finished predicate
    /// (when present) agrees. Guarded so only one query is outstanding.
    async fn maybe_finish(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if self.querying_is_finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.running_count.load(Ordering::SeqCst) > 0 {
            self.querying_is_finished.store(false, Ordering::SeqCst);
            return;
        }

        match &self.is_finished {
            None => self.finish().await,
            Some(predicate) => match predicate().await {
                // A task may have started while the predicate ran.
                Ok(true) => {
                    if self.running_count.load(Ordering::SeqCst) == 0 {
                        self.finish().await;
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("is_finished failed: {:#}", e),
            },
        }
        self.querying_is_finished.store(false, Ordering::SeqCst);
    }

    async fn finish(&self) {
        if let Some(tx) = self.outcome.lock().await.take() {
            self.shutdown.store(true, Ordering::SeqCst);
            let _ = tx.send(Ok(()));
        }
    }

    async fn fail(&self, error: anyhow::Error) {
        if let Some(tx) = self.outcome.lock().await.take() {
            self.shutdown.store(true, Ordering::SeqCst);
            error!("Task failed, aborting the run: {:#}", error);
            let _ = tx.send(Err(error));
        }
    }

    async fn teardown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let background = {
            let mut guard = self
                .background
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        // Dropping the CPU listener here removes this pool's bus subscription.
        for handle in background {
            handle.abort();
        }
    }

    fn push_background(&self, handle: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySnapshot, SystemMemoryProbe};
    use crate::system_events::SystemEventBus;

    fn test_pool(config: AutoscaledPoolConfig) -> Arc<AutoscaledPool> {
        AutoscaledPool::new(AutoscaledPoolOptions {
            config,
            run_task: Arc::new(|| None),
            is_task_ready: None,
            is_finished: None,
            memory_probe: Arc::new(SystemMemoryProbe::new()),
            cpu_bus: Arc::new(SystemEventBus::default()),
        })
    }

    fn scaling_state(total_bytes: u64) -> ScalingState {
        ScalingState {
            free_bytes_history: SampleRing::new(SCALE_UP_INTERVAL),
            cpu_overloaded_history: SampleRing::new(SCALE_DOWN_INTERVAL),
            tick_counter: 0,
            last_total_bytes: total_bytes,
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    #[tokio::test]
    async fn min_concurrency_is_clamped_to_max() {
        let pool = test_pool(AutoscaledPoolConfig {
            min_concurrency: 50,
            max_concurrency: 10,
            ..Default::default()
        });
        assert_eq!(pool.current_concurrency(), 10);
    }

    #[tokio::test]
    async fn scale_up_is_capped_at_max_step() {
        let pool = test_pool(AutoscaledPoolConfig {
            min_concurrency: 1,
            max_concurrency: 1000,
            ..Default::default()
        });
        let mut scaling = scaling_state(GIB);
        // 90% free throughout, so headroom is far beyond the step cap.
        for _ in 0..SCALE_UP_INTERVAL {
            scaling.free_bytes_history.push(9 * GIB / 10);
        }
        scaling.tick_counter = SCALE_UP_INTERVAL as u64;
        pool.maybe_scale_up(&scaling);
        assert_eq!(pool.current_concurrency(), 1 + SCALE_UP_MAX_STEP);
    }

    #[tokio::test]
    async fn scale_up_divides_headroom_by_running_tasks() {
        let pool = test_pool(AutoscaledPoolConfig {
            min_concurrency: 1,
            max_concurrency: 1000,
            ..Default::default()
        });
        let mut scaling = scaling_state(GIB);
        // 60% free at the low point: 40% taken, 50% above the hard floor.
        for _ in 0..SCALE_UP_INTERVAL {
            scaling.free_bytes_history.push(6 * GIB / 10);
        }
        scaling.tick_counter = SCALE_UP_INTERVAL as u64;
        // running_count == 0 must behave like a single running task.
        pool.maybe_scale_up(&scaling);
        assert_eq!(pool.current_concurrency(), 2);
    }

    #[tokio::test]
    async fn scale_up_skips_when_no_headroom() {
        let pool = test_pool(AutoscaledPoolConfig {
            min_concurrency: 1,
            max_concurrency: 1000,
            ..Default::default()
        });
        let mut scaling = scaling_state(GIB);
        for _ in 0..SCALE_UP_INTERVAL {
            scaling.free_bytes_history.push(GIB / 20);
        }
        scaling.tick_counter = SCALE_UP_INTERVAL as u64;
        pool.maybe_scale_up(&scaling);
        assert_eq!(pool.current_concurrency(), 1);
    }

    #[tokio::test]
    async fn scale_down_requires_unanimous_cpu_overload() {
        let pool = test_pool(AutoscaledPoolConfig {
            min_concurrency: 1,
            max_concurrency: 100,
            ..Default::default()
        });
        pool.concurrency.store(10, Ordering::SeqCst);

        let mut scaling = scaling_state(GIB);
        for _ in 0..SCALE_DOWN_INTERVAL {
            scaling.free_bytes_history.push(GIB / 2);
        }
        scaling.tick_counter = SCALE_DOWN_INTERVAL as u64;

        scaling.cpu_overloaded_history.push(false);
        for _ in 0..(SCALE_DOWN_INTERVAL - 1) {
            scaling.cpu_overloaded_history.push(true);
        }
        assert!(!pool.maybe_scale_down(&scaling));
        assert_eq!(pool.current_concurrency(), 10);

        // The dissenting sample ages out.
        scaling.cpu_overloaded_history.push(true);
        assert!(pool.maybe_scale_down(&scaling));
        assert_eq!(pool.current_concurrency(), 9);
    }

    #[tokio::test]
    async fn scale_down_on_low_free_memory() {
        let pool = test_pool(AutoscaledPoolConfig {
            min_concurrency: 1,
            max_concurrency: 100,
            min_free_memory_ratio: 0.2,
            ..Default::default()
        });
        pool.concurrency.store(5, Ordering::SeqCst);

        let mut scaling = scaling_state(GIB);
        for _ in 0..SCALE_DOWN_INTERVAL {
            scaling.free_bytes_history.push(GIB / 10);
        }
        scaling.tick_counter = SCALE_DOWN_INTERVAL as u64;
        assert!(pool.maybe_scale_down(&scaling));
        assert_eq!(pool.current_concurrency(), 4);
    }

    #[tokio::test]
    async fn scale_down_never_goes_below_the_floor() {
        let pool = test_pool(AutoscaledPoolConfig {
            min_concurrency: 3,
            max_concurrency: 100,
            ..Default::default()
        });
        let mut scaling = scaling_state(GIB);
        for _ in 0..SCALE_DOWN_INTERVAL {
            scaling.free_bytes_history.push(0);
        }
        scaling.tick_counter = SCALE_DOWN_INTERVAL as u64;
        assert!(!pool.maybe_scale_down(&scaling));
        assert_eq!(pool.current_concurrency(), 3);
    }

    struct FixedProbe {
        free_bytes: u64,
        total_bytes: u64,
    }

    impl MemoryProbe for FixedProbe {
        fn snapshot(&self) -> BoxFuture<'_, Result<MemorySnapshot>> {
            Box::pin(async move {
                Ok(MemorySnapshot {
                    free_bytes: self.free_bytes,
                    total_bytes: self.total_bytes,
                })
            })
        }
    }

    #[tokio::test]
    async fn autoscale_tick_clamps_total_to_configured_cap() {
        let pool = AutoscaledPool::new(AutoscaledPoolOptions {
            config: AutoscaledPoolConfig {
                max_memory_mbytes: Some(2048),
                ..Default::default()
            },
            run_task: Arc::new(|| None),
            is_task_ready: None,
            is_finished: None,
            memory_probe: Arc::new(FixedProbe {
                free_bytes: GIB,
                total_bytes: 8 * GIB,
            }),
            cpu_bus: Arc::new(SystemEventBus::default()),
        });

        pool.autoscale_tick().await;

        let scaling = pool.scaling.lock().await;
        assert_eq!(scaling.last_total_bytes, 2 * GIB);
        assert_eq!(scaling.tick_counter, 1);
    }

    #[tokio::test]
    async fn failing_probe_leaves_scaling_state_untouched() {
        struct BrokenProbe;
        impl MemoryProbe for BrokenProbe {
            fn snapshot(&self) -> BoxFuture<'_, Result<MemorySnapshot>> {
                Box::pin(async move { anyhow::bail!("probe offline") })
            }
        }

        let pool = AutoscaledPool::new(AutoscaledPoolOptions {
            config: AutoscaledPoolConfig::default(),
            run_task: Arc::new(|| None),
            is_task_ready: None,
            is_finished: None,
            memory_probe: Arc::new(BrokenProbe),
            cpu_bus: Arc::new(SystemEventBus::default()),
        });

        pool.autoscale_tick().await;
        assert_eq!(pool.scaling.lock().await.tick_counter, 0);
    }
}
