//! chromiumoxide-backed production launcher
//!
//! Wraps a Chrome/Chromium process behind the pool's [`BrowserHandle`] seam.
//! Disconnection is detected by the CDP handler stream ending; page closure is
//! reported by the [`ChromiumPage`] wrapper so the pool's accounting never
//! depends on raw CDP target events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::inspector::EventTargetCrashed;
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{BrowserEvent, BrowserHandle, BrowserLauncher, LaunchError, LaunchOptions};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Bounded so a wedged CDP close cannot hold the browser lock past the pool's
/// scheduled force-kill.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(4);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Launches Chromium processes configured from [`LaunchOptions`].
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    options: LaunchOptions,
}

impl ChromiumLauncher {
    #[must_use]
    pub fn new(options: LaunchOptions) -> Self {
        Self { options }
    }
}

impl BrowserLauncher for ChromiumLauncher {
    type Browser = ChromiumBrowser;

    fn launch(&self) -> BoxFuture<'static, Result<Arc<ChromiumBrowser>, LaunchError>> {
        let options = self.options.clone();
        Box::pin(async move {
            ChromiumBrowser::launch(options)
                .await
                .map_err(LaunchError::new)
        })
    }
}

/// A running Chromium process and its CDP handler task.
#[derive(Debug)]
pub struct ChromiumBrowser {
    browser: Mutex<Browser>,
    events: broadcast::Sender<BrowserEvent>,
    handler: JoinHandle<()>,
}

impl ChromiumBrowser {
    async fn launch(options: LaunchOptions) -> Result<Arc<Self>> {
        let config = build_config(&options)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let disconnect_tx = events.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(result) = handler.next().await {
                if let Err(e) = result {
                    let message = e.to_string();
                    // Chrome emits CDP payloads chromiumoxide does not model;
                    // those deserialization misses are not fatal.
                    if message.contains("data did not match any variant of untagged enum Message")
                        || message.contains("Failed to deserialize WS response")
                    {
                        trace!(error = %message, "ignoring benign CDP handler error");
                        continue;
                    }
                    debug!(error = %message, "browser handler error");
                }
            }
            // Stream end means the CDP connection is gone for good.
            let _ = disconnect_tx.send(BrowserEvent::Disconnected);
        });

        Ok(Arc::new(Self {
            browser: Mutex::new(browser),
            events,
            handler: handler_task,
        }))
    }
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl BrowserHandle for ChromiumBrowser {
    type Page = ChromiumPage;

    fn new_page(&self) -> BoxFuture<'_, Result<ChromiumPage>> {
        Box::pin(async move {
            let browser = self.browser.lock().await;
            let page = browser
                .new_page("about:blank")
                .await
                .context("failed to open new page")?;
            drop(browser);

            // A crashed renderer leaves the page unusable; close it so the
            // pool's accounting observes the loss.
            match page.event_listener::<EventTargetCrashed>().await {
                Ok(mut crashes) => {
                    let crashed_page = page.clone();
                    tokio::spawn(async move {
                        if crashes.next().await.is_some() {
                            warn!("page crashed, closing it");
                            let _ = crashed_page.close().await;
                        }
                    });
                }
                Err(e) => debug!(error = %e, "could not attach page crash listener"),
            }

            Ok(ChromiumPage {
                page,
                events: self.events.clone(),
                closed: AtomicBool::new(false),
            })
        })
    }

    fn open_page_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let browser = self.browser.lock().await;
            let pages = browser.pages().await.context("failed to list pages")?;
            Ok(pages.len())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut browser = self.browser.lock().await;
            tokio::time::timeout(CLOSE_TIMEOUT, async {
                browser.close().await.context("browser close failed")?;
                let _ = browser.wait().await;
                Ok::<_, anyhow::Error>(())
            })
            .await
            .context("browser close timed out")??;
            Ok(())
        })
    }

    fn force_kill(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut browser = self.browser.lock().await;
            match browser.kill().await {
                Some(Ok(())) => debug!("browser process killed"),
                Some(Err(e)) => debug!(error = %e, "failed to kill browser process"),
                // No child process to kill, e.g. it already exited.
                None => debug!("no browser process handle to kill"),
            }
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<BrowserEvent> {
        self.events.subscribe()
    }
}

/// A pool-owned page.
///
/// Closing or dropping the wrapper reports the page back to the pool; the
/// underlying CDP target is closed on a best-effort basis.
pub struct ChromiumPage {
    page: Page,
    events: broadcast::Sender<BrowserEvent>,
    closed: AtomicBool,
}

impl ChromiumPage {
    /// The underlying CDP page.
    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Close the page and report it to the pool.
    pub async fn close(self) -> Result<()> {
        self.notify_closed();
        self.page.clone().close().await.context("page close failed")
    }

    fn notify_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(BrowserEvent::PageClosed);
        }
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(BrowserEvent::PageClosed);
            let page = self.page.clone();
            tokio::spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}

fn build_config(options: &LaunchOptions) -> Result<BrowserConfig> {
    let mut builder = BrowserConfigBuilder::default().request_timeout(REQUEST_TIMEOUT);

    if options.headless {
        builder = builder.headless_mode(HeadlessMode::default());
    } else {
        builder = builder.with_head();
    }

    if let Some(dir) = &options.user_data_dir {
        builder = builder.user_data_dir(dir);
    }

    if let Some(proxy) = &options.proxy_url {
        builder = builder.arg(format!("--proxy-server={proxy}"));
    }

    if options.ignore_https_errors || options.disable_web_security {
        builder = builder.arg("--ignore-certificate-errors");
    }

    if options.disable_web_security {
        builder = builder.arg("--disable-web-security");
    }

    for arg in &options.args {
        builder = builder.arg(arg);
    }

    builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))
}
