//! Per-stream traffic counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated on the hot path of one stream
#[derive(Debug, Default)]
pub struct StreamStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    write_drops: AtomicU64,
    reads: AtomicU64,
    read_misses: AtomicU64,
    faults: AtomicU64,
    remaps: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatsSnapshot {
    /// Slots announced to readers
    pub published: u64,
    /// Publications lost to a stuck index mutex
    pub publish_failures: u64,
    /// Write attempts that found every slot busy
    pub write_drops: u64,
    /// Slots handed to readers
    pub reads: u64,
    /// Publications a reader could not lock in time
    pub read_misses: u64,
    /// Fault events raised
    pub faults: u64,
    /// Segment remaps performed
    pub remaps: u64,
}

impl StreamStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_drop(&self) {
        self.write_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_miss(&self) {
        self.read_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remap(&self) {
        self.remaps.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            write_drops: self.write_drops.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            remaps: self.remaps.load(Ordering::Relaxed),
        }
    }
}
