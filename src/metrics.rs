//! Cache statistics counters.
//!
//! Counters are monotonic and updated with relaxed atomics; read them
//! through [`CacheMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters for one cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    journal_rebuilds: AtomicU64,
    recoveries: AtomicU64,
}

impl CacheMetrics {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_journal_rebuild(&self) {
        self.journal_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            journal_rebuilds: self.journal_rebuilds.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheMetrics`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// `get` calls that returned a snapshot.
    pub hits: u64,
    /// `get` calls that found no readable entry.
    pub misses: u64,
    /// Entries evicted by the background trimmer.
    pub evictions: u64,
    /// Bytes reclaimed by trimmer evictions.
    pub evicted_bytes: u64,
    /// Journal compactions performed.
    pub journal_rebuilds: u64,
    /// Corrupt directories discarded at open.
    pub recoveries: u64,
}
