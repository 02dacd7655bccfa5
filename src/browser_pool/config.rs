//! Browser pool configuration

use std::time::Duration;

/// How long a killed instance gets to close cooperatively before its OS
/// process is terminated outright.
pub(crate) const PROCESS_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`BrowserPool`](super::BrowserPool).
#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Hard cap of concurrently open pages per browser; exceeding it makes
    /// the pool launch another browser (default: 100).
    pub max_open_pages_per_instance: u64,
    /// After this many cumulative pages a browser is retired, which defeats
    /// per-session tracking and bounds its memory growth (default: 150).
    pub abort_instance_after_page_count: u64,
    /// Sweep period of the instance reaper (default: 60 s).
    pub instance_killer_interval: Duration,
    /// Maximum idle time since the last page grant before a retired browser
    /// is closed regardless of open pages (default: 300 s).
    pub kill_instance_after: Duration,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            max_open_pages_per_instance: 100,
            abort_instance_after_page_count: 150,
            instance_killer_interval: Duration::from_secs(60),
            kill_instance_after: Duration::from_secs(300),
        }
    }
}
