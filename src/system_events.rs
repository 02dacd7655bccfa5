//! Process-level system load events
//!
//! A small publish/subscribe bus carrying CPU overload samples from an
//! external supervisor to any number of autoscaled pools. The bus must be
//! created before any pool subscribes and torn down only after every pool has
//! destroyed itself; each pool removes exactly its own subscription when its
//! run settles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One CPU load observation from the supervising process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfoSample {
    /// Whether the supervisor considers the CPU overloaded right now.
    pub is_overloaded: bool,
    /// When the sample was taken.
    pub created_at: DateTime<Utc>,
}

/// Events published on the system bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemEvent {
    /// Periodic CPU load report.
    CpuInfo(CpuInfoSample),
}

impl SystemEvent {
    /// Create a `CpuInfo` event stamped with the current time.
    #[must_use]
    pub fn cpu_info(is_overloaded: bool) -> Self {
        Self::CpuInfo(CpuInfoSample {
            is_overloaded,
            created_at: Utc::now(),
        })
    }
}

/// Broadcast bus for [`SystemEvent`]s.
#[derive(Debug)]
pub struct SystemEventBus {
    sender: broadcast::Sender<SystemEvent>,
}

impl SystemEventBus {
    /// Create a new bus buffering at most `capacity` undelivered events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers the event was delivered to. An event
    /// published with no subscribers is silently dropped; load samples are
    /// only meaningful to pools that are currently running.
    pub fn publish(&self, event: SystemEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Whether anyone is listening.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl Default for SystemEventBus {
    fn default() -> Self {
        // Load samples are tiny and stale ones are worthless, so a small
        // buffer is enough.
        Self::new(64)
    }
}
