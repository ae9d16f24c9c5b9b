//! Runtime counters.
//!
//! One [`RuntimeMetrics`] instance is created per node and handed to every
//! entity, the reference table and the distribution managers through an
//! `Arc`. There is no process-global counter state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic counters incremented by runtime entities.
///
/// All reads and writes use `Ordering::Relaxed`: metrics are advisory,
/// not transactional.
#[derive(Debug)]
pub struct RuntimeMetrics {
    /// Records forwarded by collectors.
    pub records_forwarded: AtomicU64,
    /// Collector barriers released.
    pub barriers_released: AtomicU64,
    /// `sort_end` records discarded because they did not match the buffered one.
    pub barrier_mismatches: AtomicU64,
    /// Entities spawned.
    pub entities_spawned: AtomicU64,
    /// Entities that returned.
    pub entities_exited: AtomicU64,
    /// Box invocations.
    pub box_invocations: AtomicU64,
    /// Remote fetches issued.
    pub fetches_issued: AtomicU64,
    /// Fetch waiters released with a private copy.
    pub fetch_waiters_released: AtomicU64,
    /// Reference count updates sent to an origin node.
    pub ref_updates_sent: AtomicU64,
    /// Exported data items freed after their last remote holder went away.
    pub exported_data_freed: AtomicU64,
    /// Records sent to other nodes.
    pub records_sent: AtomicU64,
    /// Records received from other nodes.
    pub records_received: AtomicU64,
    /// Destinations blocked by backpressure from the receiving side.
    pub destinations_blocked: AtomicU64,
}

impl RuntimeMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records_forwarded: AtomicU64::new(0),
            barriers_released: AtomicU64::new(0),
            barrier_mismatches: AtomicU64::new(0),
            entities_spawned: AtomicU64::new(0),
            entities_exited: AtomicU64::new(0),
            box_invocations: AtomicU64::new(0),
            fetches_issued: AtomicU64::new(0),
            fetch_waiters_released: AtomicU64::new(0),
            ref_updates_sent: AtomicU64::new(0),
            exported_data_freed: AtomicU64::new(0),
            records_sent: AtomicU64::new(0),
            records_received: AtomicU64::new(0),
            destinations_blocked: AtomicU64::new(0),
        }
    }

    /// Adds one to `counter`.
    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `n` to `counter`.
    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_forwarded: self.records_forwarded.load(Ordering::Relaxed),
            barriers_released: self.barriers_released.load(Ordering::Relaxed),
            barrier_mismatches: self.barrier_mismatches.load(Ordering::Relaxed),
            entities_spawned: self.entities_spawned.load(Ordering::Relaxed),
            entities_exited: self.entities_exited.load(Ordering::Relaxed),
            box_invocations: self.box_invocations.load(Ordering::Relaxed),
            fetches_issued: self.fetches_issued.load(Ordering::Relaxed),
            fetch_waiters_released: self.fetch_waiters_released.load(Ordering::Relaxed),
            ref_updates_sent: self.ref_updates_sent.load(Ordering::Relaxed),
            exported_data_freed: self.exported_data_freed.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            destinations_blocked: self.destinations_blocked.load(Ordering::Relaxed),
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of [`RuntimeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Records forwarded by collectors.
    pub records_forwarded: u64,
    /// Collector barriers released.
    pub barriers_released: u64,
    /// Mismatched `sort_end` records discarded.
    pub barrier_mismatches: u64,
    /// Entities spawned.
    pub entities_spawned: u64,
    /// Entities that returned.
    pub entities_exited: u64,
    /// Box invocations.
    pub box_invocations: u64,
    /// Remote fetches issued.
    pub fetches_issued: u64,
    /// Fetch waiters released.
    pub fetch_waiters_released: u64,
    /// Reference count updates sent.
    pub ref_updates_sent: u64,
    /// Exported data items freed.
    pub exported_data_freed: u64,
    /// Records sent to other nodes.
    pub records_sent: u64,
    /// Records received from other nodes.
    pub records_received: u64,
    /// Destinations blocked.
    pub destinations_blocked: u64,
}

impl MetricsSnapshot {
    /// Number of entities still running at snapshot time.
    #[must_use]
    pub fn live_entities(&self) -> u64 {
        self.entities_spawned.saturating_sub(self.entities_exited)
    }
}
