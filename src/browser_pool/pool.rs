//! Pool of rotating browser instances
//!
//! Multiplexes short-lived pages across a small set of long-lived browsers.
//! Instances move strictly forward through three states: active (accepting
//! new pages), retired (draining existing pages), gone. Retirement is driven
//! by cumulative usage, disconnects, and launch failures; a periodic reaper
//! kills retired instances once they are idle or stale.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::{BrowserPoolConfig, PROCESS_KILL_TIMEOUT};
use super::instance::{BrowserInstance, SharedLaunch};
use crate::launcher::{BrowserEvent, BrowserHandle, BrowserLauncher};

struct PoolState<B: BrowserHandle> {
    /// Instances accepting new pages.
    active: BTreeMap<u64, BrowserInstance<B>>,
    /// Instances draining; no new pages, existing ones still honored.
    retired: BTreeMap<u64, BrowserInstance<B>>,
    next_id: u64,
}

impl<B: BrowserHandle> PoolState<B> {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Pool of rotating browser instances.
pub struct BrowserPool<L: BrowserLauncher> {
    config: BrowserPoolConfig,
    launcher: Arc<L>,
    state: Mutex<PoolState<L::Browser>>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
    watchers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
    weak_self: Weak<Self>,
}

impl<L: BrowserLauncher> BrowserPool<L> {
    /// Create a new pool. Call [`start`](Self::start) to run the instance
    /// reaper.
    pub fn new(config: BrowserPoolConfig, launcher: Arc<L>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            launcher,
            state: Mutex::new(PoolState {
                active: BTreeMap::new(),
                retired: BTreeMap::new(),
                next_id: 0,
            }),
            reaper: std::sync::Mutex::new(None),
            watchers: std::sync::Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// Start the periodic reaper that closes retired instances.
    pub fn start(&self) {
        let weak = self.weak_self.clone();
        let period = self.config.instance_killer_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.sweep_retired().await;
            }
        });
        let previous = self
            .reaper
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Open a new page on some active browser, launching one if needed.
    ///
    /// The chosen instance's accounting is updated before its browser is
    /// awaited, so a still-launching browser can already be saturated with
    /// waiting callers. A failure to launch or to open the page retires the
    /// instance and is returned to the caller; the pool itself never retries.
    pub async fn new_page(&self) -> Result<<L::Browser as BrowserHandle>::Page> {
        let (id, launch) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let max_pages = self.config.max_open_pages_per_instance;

            let id = match state
                .active
                .iter()
                .find(|(_, instance)| instance.active_pages < max_pages)
                .map(|(&id, _)| id)
            {
                Some(id) => id,
                None => self.launch_instance(&mut state),
            };

            let mut granted = None;
            if let Some(instance) = state.active.get_mut(&id) {
                instance.record_grant(now);
                granted = Some(instance.browser.clone());
                if instance.total_pages >= self.config.abort_instance_after_page_count {
                    // Still serves the page just granted.
                    self.retire_locked(&mut state, id);
                }
            }
            match granted {
                Some(launch) => (id, launch),
                // The instance was just selected or inserted under this lock.
                None => unreachable!("granted instance disappeared from the active set"),
            }
        };

        let browser = match launch.await {
            Ok(browser) => browser,
            Err(e) => {
                self.retire(id).await;
                return Err(anyhow::Error::new(e).context("browser launch failed"));
            }
        };

        match browser.new_page().await {
            Ok(page) => Ok(page),
            Err(e) => {
                self.retire(id).await;
                Err(e.context(format!("failed to open page on browser instance {id}")))
            }
        }
    }

    /// Retire an instance: it stops accepting new pages but keeps serving the
    /// ones already open. Idempotent; retiring an unknown or already-retired
    /// id only logs.
    pub async fn retire(&self, id: u64) {
        let mut state = self.state.lock().await;
        self.retire_locked(&mut state, id);
    }

    fn retire_locked(&self, state: &mut PoolState<L::Browser>, id: u64) {
        match state.active.remove(&id) {
            Some(instance) => {
                info!("Retiring browser instance {}", id);
                state.retired.insert(id, instance);
            }
            None => {
                warn!("Attempted to retire browser instance {} which is not active", id);
            }
        }
    }

    /// Close every browser and stop all background work. Errors are logged,
    /// never surfaced; calling this twice is a no-op.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.abort();
        }

        let instances: Vec<(u64, SharedLaunch<L::Browser>)> = {
            let mut state = self.state.lock().await;
            let mut all = Vec::new();
            for (&id, instance) in state.active.iter().chain(state.retired.iter()) {
                // Silence the disconnects that closing is about to cause.
                instance.killed.store(true, Ordering::SeqCst);
                all.push((id, instance.browser.clone()));
            }
            state.active.clear();
            state.retired.clear();
            all
        };

        for (id, launch) in instances {
            match launch.await {
                Ok(browser) => {
                    if let Err(e) = browser.close().await {
                        warn!("Failed to close browser instance {}: {:#}", id, e);
                    }
                }
                Err(e) => {
                    debug!("Skipping close of instance {} that never launched: {}", id, e);
                }
            }
        }

        let watchers = {
            let mut guard = self
                .watchers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for watcher in watchers {
            watcher.abort();
        }
        info!("Browser pool destroyed");
    }

    /// Ids of instances currently accepting pages.
    pub async fn active_instance_ids(&self) -> Vec<u64> {
        self.state.lock().await.active.keys().copied().collect()
    }

    /// Ids of instances currently draining.
    pub async fn retired_instance_ids(&self) -> Vec<u64> {
        self.state.lock().await.retired.keys().copied().collect()
    }

    /// Number of instances currently accepting pages.
    pub async fn active_instance_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Number of instances currently draining.
    pub async fn retired_instance_count(&self) -> usize {
        self.state.lock().await.retired.len()
    }

    /// Begin launching a browser and record it as active immediately, so
    /// concurrent callers can share the pending handle.
    fn launch_instance(&self, state: &mut PoolState<L::Browser>) -> u64 {
        let id = state.allocate_id();
        let launch: SharedLaunch<L::Browser> = self.launcher.launch().shared();
        let instance = BrowserInstance::new(launch.clone());
        let killed = Arc::clone(&instance.killed);
        state.active.insert(id, instance);
        debug!("Launching browser instance {}", id);

        let weak = self.weak_self.clone();
        let watcher = tokio::spawn(async move {
            match launch.await {
                Ok(browser) => {
                    Self::watch_browser(weak, id, killed, browser.subscribe()).await;
                }
                Err(e) => {
                    if let Some(pool) = weak.upgrade() {
                        warn!("Browser instance {} failed to launch: {}", id, e);
                        pool.retire(id).await;
                    }
                }
            }
        });
        self.watchers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(watcher);
        id
    }

    /// Consume one browser's lifecycle events and feed them back into the
    /// pool state. Runs as its own task so event handling never mutates the
    /// id maps from inside a browser callback.
    async fn watch_browser(
        weak: Weak<Self>,
        id: u64,
        killed: Arc<AtomicBool>,
        mut events: broadcast::Receiver<BrowserEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(BrowserEvent::Disconnected) => {
                    if killed.load(Ordering::SeqCst) {
                        // Expected while destroying or killing; nothing to do.
                        break;
                    }
                    warn!("Browser instance {} disconnected unexpectedly", id);
                    if let Some(pool) = weak.upgrade() {
                        pool.retire(id).await;
                    }
                    break;
                }
                Ok(BrowserEvent::PageClosed) => {
                    let Some(pool) = weak.upgrade() else { break };
                    pool.on_page_closed(id).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Browser instance {} event stream lagged by {} events", id, missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn on_page_closed(&self, id: u64) {
        let kill_now = {
            let mut state = self.state.lock().await;
            if let Some(instance) = state.active.get_mut(&id) {
                instance.active_pages = instance.active_pages.saturating_sub(1);
                false
            } else if let Some(instance) = state.retired.get_mut(&id) {
                instance.active_pages = instance.active_pages.saturating_sub(1);
                instance.active_pages == 0
            } else {
                false
            }
        };
        if kill_now {
            self.kill_instance(id).await;
        }
    }

    /// One reaper pass: kill retired instances that are stale, and probe the
    /// rest for emptiness. A probe failure means the browser is unreachable,
    /// which is treated the same as empty.
    async fn sweep_retired(&self) {
        let snapshot: Vec<(u64, SharedLaunch<L::Browser>, Instant)> = {
            let state = self.state.lock().await;
            state
                .retired
                .iter()
                .map(|(&id, instance)| (id, instance.browser.clone(), instance.last_page_opened_at))
                .collect()
        };

        let now = Instant::now();
        for (id, launch, last_page_opened_at) in snapshot {
            if now.duration_since(last_page_opened_at) > self.config.kill_instance_after {
                info!("Killing retired browser instance {} (stale)", id);
                self.kill_instance(id).await;
                continue;
            }

            let open_pages = match launch.await {
                Ok(browser) => browser.open_page_count().await,
                Err(e) => Err(anyhow::Error::new(e)),
            };
            match open_pages {
                Ok(0) => {
                    info!("Killing retired browser instance {} (no open pages)", id);
                    self.kill_instance(id).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Page probe failed for browser instance {}: {:#}", id, e);
                    self.kill_instance(id).await;
                }
            }
        }
    }

    /// Remove a retired instance and shut its browser down: a hard process
    /// kill is scheduled first so a wedged cooperative close cannot keep the
    /// process alive, then `close()` is attempted once. Idempotent; every
    /// error is swallowed with a log.
    async fn kill_instance(&self, id: u64) {
        let instance = { self.state.lock().await.retired.remove(&id) };
        let Some(instance) = instance else { return };
        debug!("Killing browser instance {}", id);

        let hard_kill = instance.browser.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PROCESS_KILL_TIMEOUT).await;
            if let Ok(browser) = hard_kill.await {
                browser.force_kill().await;
            }
        });

        if !instance.killed.swap(true, Ordering::SeqCst) {
            match instance.browser.clone().await {
                Ok(browser) => {
                    if let Err(e) = browser.close().await {
                        warn!("Failed to close browser instance {}: {:#}", id, e);
                    }
                }
                // Never launched; there is no process to close.
                Err(_) => {}
            }
        }
    }
}
