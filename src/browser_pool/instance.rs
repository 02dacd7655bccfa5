//! Per-browser bookkeeping record

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use crate::launcher::{BrowserHandle, LaunchError};

/// A browser launch in flight, shareable by every caller waiting on the same
/// instance. The pool record is the sole owner of the browser; consumers of
/// this future only borrow its lifetime.
pub(crate) type SharedLaunch<B> = Shared<BoxFuture<'static, Result<Arc<B>, LaunchError>>>;

/// One managed browser, from launch through retirement to removal. Its id
/// lives as the key of the pool map holding it.
pub(crate) struct BrowserInstance<B: BrowserHandle> {
    /// Eventually-resolved browser handle. Recorded while still pending so
    /// concurrent page requests can pile onto a launching browser.
    pub(crate) browser: SharedLaunch<B>,
    /// Pages currently open according to pool accounting.
    pub(crate) active_pages: u64,
    /// Cumulative pages ever granted. Monotone.
    pub(crate) total_pages: u64,
    /// When the most recent page was granted.
    pub(crate) last_page_opened_at: Instant,
    /// Set once shutdown of this instance has begun; prevents duplicate kills
    /// and silences the disconnect that follows a deliberate close.
    pub(crate) killed: Arc<AtomicBool>,
}

impl<B: BrowserHandle> BrowserInstance<B> {
    pub(crate) fn new(browser: SharedLaunch<B>) -> Self {
        Self {
            browser,
            active_pages: 0,
            total_pages: 0,
            last_page_opened_at: Instant::now(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record one page grant. Called before the browser is awaited so the
    /// accounting is visible to concurrent callers immediately.
    pub(crate) fn record_grant(&mut self, now: Instant) {
        self.last_page_opened_at = now;
        self.total_pages += 1;
        self.active_pages += 1;
    }
}
