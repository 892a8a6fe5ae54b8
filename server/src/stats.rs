//! Per-connection traffic counters, reported to the client every interval.
//!
//! Atomics only: relays bump them on the hot path, the writer task adds sent
//! bytes, and the stats loop swaps them back to zero.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one connection's current reporting interval.
#[derive(Debug, Default)]
pub struct Counters {
    objects_sent: AtomicU64,
    bytes_removed: AtomicU64,
    bytes_sent: AtomicU64,
}

/// A point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub objects_sent: u64,
    pub bytes_removed: u64,
    pub bytes_sent: u64,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One projected object queued for a subscriber.
    pub fn record_object(&self, bytes_removed: u64) {
        self.objects_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_removed.fetch_add(bytes_removed, Ordering::Relaxed);
    }

    /// One frame written to the socket.
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Read without resetting.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            objects_sent: self.objects_sent.load(Ordering::Relaxed),
            bytes_removed: self.bytes_removed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Read and reset for the next interval.
    pub fn take(&self) -> StatsSnapshot {
        StatsSnapshot {
            objects_sent: self.objects_sent.swap(0, Ordering::Relaxed),
            bytes_removed: self.bytes_removed.swap(0, Ordering::Relaxed),
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
        }
    }
}
