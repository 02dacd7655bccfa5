//! Scripted collaborators for the crawlpool test suite

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use anyhow::Result;
use crawlpool::{BrowserEvent, BrowserHandle, BrowserLauncher, LaunchError, MemoryProbe, MemorySnapshot};
use futures::future::BoxFuture;
use tokio::sync::broadcast;

/// A page handed out by [`FakeBrowser`]. Closing is reported manually via
/// [`FakeBrowser::close_page`], mirroring how a real browser emits a target
/// teardown event rather than the page wrapper doing pool bookkeeping.
#[derive(Debug)]
pub struct FakePage;

/// In-memory browser with scripted failures and observable lifecycle calls.
pub struct FakeBrowser {
    events: broadcast::Sender<BrowserEvent>,
    open_pages: AtomicUsize,
    close_calls: AtomicUsize,
    force_kills: AtomicUsize,
    fail_new_page: AtomicBool,
    fail_page_count: AtomicBool,
}

impl FakeBrowser {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            open_pages: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            force_kills: AtomicUsize::new(0),
            fail_new_page: AtomicBool::new(false),
            fail_page_count: AtomicBool::new(false),
        }
    }

    /// Close one page and report it, as a browser would via target teardown.
    #[allow(dead_code)]
    pub fn close_page(&self) {
        self.open_pages.fetch_sub(1, Ordering::SeqCst);
        let _ = self.events.send(BrowserEvent::PageClosed);
    }

    /// Simulate the browser process dying.
    #[allow(dead_code)]
    pub fn emit_disconnected(&self) {
        let _ = self.events.send(BrowserEvent::Disconnected);
    }

    /// Make the next `new_page` call fail.
    #[allow(dead_code)]
    pub fn fail_next_new_page(&self) {
        self.fail_new_page.store(true, Ordering::SeqCst);
    }

    /// Make page-count probes fail from now on.
    #[allow(dead_code)]
    pub fn break_page_count(&self) {
        self.fail_page_count.store(true, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn force_kills(&self) -> usize {
        self.force_kills.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn open_pages(&self) -> usize {
        self.open_pages.load(Ordering::SeqCst)
    }
}

impl BrowserHandle for FakeBrowser {
    type Page = FakePage;

    fn new_page(&self) -> BoxFuture<'_, Result<FakePage>> {
        Box::pin(async move {
            if self.fail_new_page.swap(false, Ordering::SeqCst) {
                anyhow::bail!("browser refused to open a page");
            }
            self.open_pages.fetch_add(1, Ordering::SeqCst);
            Ok(FakePage)
        })
    }

    fn open_page_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            if self.fail_page_count.load(Ordering::SeqCst) {
                anyhow::bail!("browser connection lost");
            }
            Ok(self.open_pages.load(Ordering::SeqCst))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            // A closing browser disconnects its event stream.
            let _ = self.events.send(BrowserEvent::Disconnected);
            Ok(())
        })
    }

    fn force_kill(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.force_kills.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<BrowserEvent> {
        self.events.subscribe()
    }
}

/// Launcher producing [`FakeBrowser`]s, with scripted launch failures.
pub struct FakeLauncher {
    browsers: std::sync::Mutex<Vec<Arc<FakeBrowser>>>,
    fail_next: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            browsers: std::sync::Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        })
    }

    /// Every browser launched so far, oldest first.
    pub fn browsers(&self) -> Vec<Arc<FakeBrowser>> {
        self.browsers
            .lock()
            .expect("browser list lock poisoned")
            .clone()
    }

    #[allow(dead_code)]
    pub fn launch_count(&self) -> usize {
        self.browsers.lock().expect("browser list lock poisoned").len()
    }

    /// Make the next launch fail.
    #[allow(dead_code)]
    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl BrowserLauncher for FakeLauncher {
    type Browser = FakeBrowser;

    fn launch(&self) -> BoxFuture<'static, Result<Arc<FakeBrowser>, LaunchError>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Box::pin(futures::future::ready(Err(LaunchError::new(
                anyhow::anyhow!("scripted launch failure"),
            ))));
        }
        let browser = Arc::new(FakeBrowser::new());
        self.browsers
            .lock()
            .expect("browser list lock poisoned")
            .push(Arc::clone(&browser));
        Box::pin(futures::future::ready(Ok(browser)))
    }
}

/// Memory probe returning whatever the test scripts into it.
pub struct ScriptedMemoryProbe {
    free_bytes: AtomicU64,
    total_bytes: AtomicU64,
    failing: AtomicBool,
}

impl ScriptedMemoryProbe {
    #[allow(dead_code)]
    pub fn new(free_bytes: u64, total_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            free_bytes: AtomicU64::new(free_bytes),
            total_bytes: AtomicU64::new(total_bytes),
            failing: AtomicBool::new(false),
        })
    }

    #[allow(dead_code)]
    pub fn set_free_bytes(&self, free_bytes: u64) {
        self.free_bytes.store(free_bytes, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl MemoryProbe for ScriptedMemoryProbe {
    fn snapshot(&self) -> BoxFuture<'_, Result<MemorySnapshot>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("memory probe offline");
            }
            Ok(MemorySnapshot {
                free_bytes: self.free_bytes.load(Ordering::SeqCst),
                total_bytes: self.total_bytes.load(Ordering::SeqCst),
            })
        })
    }
}

/// Let spawned pool tasks (watchers, drivers) observe pending events.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
