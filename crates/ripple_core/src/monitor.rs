//! In-flight operation monitor.
//!
//! A monitor counts the operations tagged with it that are currently running
//! and remembers which transactions they run in. It is purely observational:
//! typical use is a "busy" indicator that a UI reads while async loads are
//! pending.

use crate::types::SnapshotId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counter and set of in-flight transactions for tagged operations.
#[derive(Debug)]
pub struct Monitor {
    name: String,
    count: AtomicUsize,
    workers: Mutex<HashMap<SnapshotId, usize>>,
}

impl Monitor {
    /// Creates a new monitor.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            count: AtomicUsize::new(0),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the monitor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of in-flight operations.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true while at least one tagged operation is running.
    pub fn is_active(&self) -> bool {
        self.count() > 0
    }

    /// Returns the transactions that currently run tagged operations.
    pub fn workers(&self) -> Vec<SnapshotId> {
        let mut ids: Vec<SnapshotId> = self.workers.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registers an operation running in `snapshot` until the guard drops.
    pub fn enter(self: &Arc<Self>, snapshot: SnapshotId) -> MonitorGuard {
        *self.workers.lock().entry(snapshot).or_insert(0) += 1;
        self.count.fetch_add(1, Ordering::AcqRel);
        MonitorGuard {
            monitor: Arc::clone(self),
            snapshot,
        }
    }

    fn exit(&self, snapshot: SnapshotId) {
        {
            let mut workers = self.workers.lock();
            if let Some(n) = workers.get_mut(&snapshot) {
                *n -= 1;
                if *n == 0 {
                    workers.remove(&snapshot);
                }
            }
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keeps one operation registered with a [`Monitor`].
#[derive(Debug)]
pub struct MonitorGuard {
    monitor: Arc<Monitor>,
    snapshot: SnapshotId,
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.monitor.exit(self.snapshot);
    }
}
