//! Engine statistics.
//!
//! Counters are updated with relaxed atomics from every transaction and
//! cache evaluation; read them at any time through [`Engine::stats`].
//!
//! ```rust,ignore
//! let stats = engine.stats().snapshot();
//! println!("applied: {}", stats.transactions_applied);
//! println!("cache hits: {}", stats.cache_hits);
//! ```
//!
//! [`Engine::stats`]: crate::Engine::stats

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine statistics and metrics.
///
/// All counters are monotonically increasing.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Field access
    reads: AtomicU64,
    writes: AtomicU64,

    // Transactions
    transactions_started: AtomicU64,
    transactions_applied: AtomicU64,
    transactions_discarded: AtomicU64,
    conflicts: AtomicU64,
    cancellations: AtomicU64,

    // Caches
    cache_hits: AtomicU64,
    cache_evaluations: AtomicU64,
    invalidations: AtomicU64,
    triggers_run: AtomicU64,
    reentrance_rejections: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_apply(&self) {
        self.transactions_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_discard(&self) {
        self.transactions_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_evaluation(&self) {
        self.cache_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_trigger_run(&self) {
        self.triggers_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reentrance_rejection(&self) {
        self.reentrance_rejections.fetch_add(1, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns the total number of field reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the total number of field writes.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions applied.
    pub fn transactions_applied(&self) -> u64 {
        self.transactions_applied.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions discarded.
    pub fn transactions_discarded(&self) -> u64 {
        self.transactions_discarded.load(Ordering::Relaxed)
    }

    /// Returns the total number of conflicts detected at seal time.
    ///
    /// Includes conflicts ignored by side-by-side transactions.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Returns the total number of canceled transactions.
    pub fn cancellations(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }

    /// Returns the total number of cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the total number of cache body evaluations.
    pub fn cache_evaluations(&self) -> u64 {
        self.cache_evaluations.load(Ordering::Relaxed)
    }

    /// Returns the total number of cache entries invalidated.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Returns the total number of trigger runs.
    pub fn triggers_run(&self) -> u64 {
        self.triggers_run.load(Ordering::Relaxed)
    }

    /// Returns the total number of calls rejected by reentrance policy.
    pub fn reentrance_rejections(&self) -> u64 {
        self.reentrance_rejections.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads(),
            writes: self.writes(),
            transactions_started: self.transactions_started(),
            transactions_applied: self.transactions_applied(),
            transactions_discarded: self.transactions_discarded(),
            conflicts: self.conflicts(),
            cancellations: self.cancellations(),
            cache_hits: self.cache_hits(),
            cache_evaluations: self.cache_evaluations(),
            invalidations: self.invalidations(),
            triggers_run: self.triggers_run(),
            reentrance_rejections: self.reentrance_rejections(),
        }
    }
}

/// A point-in-time snapshot of engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Total number of field reads.
    pub reads: u64,
    /// Total number of field writes.
    pub writes: u64,
    /// Total number of transactions started.
    pub transactions_started: u64,
    /// Total number of transactions applied.
    pub transactions_applied: u64,
    /// Total number of transactions discarded.
    pub transactions_discarded: u64,
    /// Total number of conflicts detected.
    pub conflicts: u64,
    /// Total number of canceled transactions.
    pub cancellations: u64,
    /// Total number of cache hits.
    pub cache_hits: u64,
    /// Total number of cache body evaluations.
    pub cache_evaluations: u64,
    /// Total number of cache entries invalidated.
    pub invalidations: u64,
    /// Total number of trigger runs.
    pub triggers_run: u64,
    /// Total number of reentrance rejections.
    pub reentrance_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = EngineStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_transactions() {
        let stats = EngineStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_apply();
        stats.record_transaction_discard();
        stats.record_conflict();

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 2);
        assert_eq!(snap.transactions_applied, 1);
        assert_eq!(snap.transactions_discarded, 1);
        assert_eq!(snap.conflicts, 1);
    }

    #[test]
    fn record_invalidations_adds_count() {
        let stats = EngineStats::new();
        stats.record_invalidations(3);
        stats.record_invalidations(2);
        assert_eq!(stats.invalidations(), 5);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(EngineStats::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_read();
                    s.record_cache_hit();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.reads(), 1000);
        assert_eq!(stats.cache_hits(), 1000);
    }
}
