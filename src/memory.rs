//! System memory sampling for the autoscaler
//!
//! The autoscaled pool never reads system facts directly; it goes through the
//! [`MemoryProbe`] trait so tests can script memory pressure and production
//! code can swap in cgroup-aware probes.

use anyhow::Result;
use futures::future::BoxFuture;
use sysinfo::System;
use tokio::sync::Mutex;

/// A single observation of system memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Bytes currently available for allocation without swapping.
    pub free_bytes: u64,
    /// Total bytes installed (or granted to the container).
    pub total_bytes: u64,
}

impl MemorySnapshot {
    /// Fraction of total memory that is free, in `[0, 1]`.
    #[must_use]
    pub fn free_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.free_bytes as f64 / self.total_bytes as f64
    }
}

/// Source of memory observations.
pub trait MemoryProbe: Send + Sync + 'static {
    /// Take a fresh snapshot of free and total memory.
    fn snapshot(&self) -> BoxFuture<'_, Result<MemorySnapshot>>;
}

/// Production probe backed by `sysinfo`.
///
/// The `System` handle is kept behind a mutex because refreshing mutates it;
/// a snapshot is cheap enough that contention is not a concern at the pool's
/// sampling cadence.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn snapshot(&self) -> BoxFuture<'_, Result<MemorySnapshot>> {
        Box::pin(async move {
            let mut system = self.system.lock().await;
            system.refresh_memory();
            let total_bytes = system.total_memory();
            if total_bytes == 0 {
                anyhow::bail!("system reported zero total memory");
            }
            Ok(MemorySnapshot {
                free_bytes: system.available_memory(),
                total_bytes,
            })
        })
    }
}
