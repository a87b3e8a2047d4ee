use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters for one connection, written only by the channel transport.
#[derive(Debug, Default)]
pub struct BandwidthTracker {
    up: AtomicU64,
    down: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthUsage {
    pub up: u64,
    pub down: u64,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, bytes: u64) {
        self.up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: u64) {
        self.down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn usage(&self) -> BandwidthUsage {
        BandwidthUsage {
            up: self.up.load(Ordering::Relaxed),
            down: self.down.load(Ordering::Relaxed),
        }
    }
}
