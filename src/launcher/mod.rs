//! Browser launching seam
//!
//! The browser pool talks to real browsers only through [`BrowserHandle`] and
//! [`BrowserLauncher`]. The production implementation lives in
//! [`chromium`]; tests provide scripted fakes.

pub mod chromium;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

/// Lifecycle signals emitted by a running browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEvent {
    /// The browser process went away (crash, external kill, or graceful close).
    Disconnected,
    /// One logical page owned by this browser was closed.
    PageClosed,
}

/// Options recognized when launching a browser.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Run without a visible window.
    pub headless: bool,
    /// Extra command-line arguments passed through verbatim.
    pub args: Vec<String>,
    /// Proxy server URL for all page traffic.
    pub proxy_url: Option<String>,
    /// Accept invalid or self-signed TLS certificates.
    pub ignore_https_errors: bool,
    /// Disable same-origin enforcement. Implies `ignore_https_errors`.
    pub disable_web_security: bool,
    /// Profile directory; a throwaway one is used when absent.
    pub user_data_dir: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            args: Vec::new(),
            proxy_url: None,
            ignore_https_errors: false,
            disable_web_security: false,
            user_data_dir: None,
        }
    }
}

/// A launch failure, cloneable so that every consumer of a shared pending
/// launch observes the same error.
#[derive(Debug, Clone)]
pub struct LaunchError(Arc<anyhow::Error>);

impl LaunchError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // {:#} preserves the full context chain
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + Send + Sync + 'static) = self.0.as_ref().as_ref();
        Some(source)
    }
}

/// A live browser as seen by the pool.
pub trait BrowserHandle: Send + Sync + 'static {
    /// The page type handed out to pool callers.
    type Page: Send + 'static;

    /// Open a new page.
    fn new_page(&self) -> BoxFuture<'_, Result<Self::Page>>;

    /// Count of pages currently open in the browser itself.
    ///
    /// This asks the browser, not the pool's accounting; the two can disagree
    /// briefly around page churn.
    fn open_page_count(&self) -> BoxFuture<'_, Result<usize>>;

    /// Ask the browser to shut down cooperatively.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Terminate the OS process without negotiation. Must tolerate an absent
    /// or already-dead process and repeated invocation.
    fn force_kill(&self) -> BoxFuture<'_, ()>;

    /// Subscribe to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<BrowserEvent>;
}

/// Factory producing live browsers.
pub trait BrowserLauncher: Send + Sync + 'static {
    type Browser: BrowserHandle;

    /// Begin launching a browser. The returned future is shared by every
    /// caller waiting on the same instance, so it must be `'static`.
    fn launch(&self) -> BoxFuture<'static, Result<Arc<Self::Browser>, LaunchError>>;
}
