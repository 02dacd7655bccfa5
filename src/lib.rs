//! Concurrent resource management for scraping runtimes
//!
//! Two cooperating cores: [`BrowserPool`] leases short-lived pages across a
//! rotating set of long-lived browser processes, and [`AutoscaledPool`] runs
//! user tasks in parallel while adapting concurrency to memory and CPU load.
//! A typical caller builds an `AutoscaledPool` whose task function leases a
//! page from a `BrowserPool`, processes one work item and closes the page;
//! the two pools share nothing but the reference.

pub mod autoscaled_pool;
pub mod browser_pool;
pub mod launcher;
pub mod memory;
pub mod system_events;

pub use autoscaled_pool::{
    AutoscaledPool, AutoscaledPoolConfig, AutoscaledPoolOptions, PredicateFn, RunTaskFn, TaskFuture,
};
pub use browser_pool::{BrowserPool, BrowserPoolConfig};
pub use launcher::chromium::{ChromiumBrowser, ChromiumLauncher, ChromiumPage};
pub use launcher::{BrowserEvent, BrowserHandle, BrowserLauncher, LaunchError, LaunchOptions};
pub use memory::{MemoryProbe, MemorySnapshot, SystemMemoryProbe};
pub use system_events::{CpuInfoSample, SystemEvent, SystemEventBus};
