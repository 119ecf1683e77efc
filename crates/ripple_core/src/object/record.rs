//! Versioned records and field values.
//!
//! A committed [`Record`] holds the complete field state of one object as of
//! one applied snapshot and links back to the record it replaced. Records are
//! never mutated after commit; a snapshot that writes an object works on a
//! [`PendingWrite`] copied from the record it sees and publishes a new record
//! at apply.

use crate::cache::entry::CacheEntry;
use crate::types::{FieldKey, SnapshotId, Stamp};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

/// A field value plus the cache entries that read it.
///
/// The observer set only grows until the value is superseded by a newer
/// commit; superseding drains it and rejects later subscriptions.
pub(crate) struct FieldValue {
    pub(crate) value: Value,
    observers: Mutex<Observers>,
}

#[derive(Default)]
struct Observers {
    caches: Vec<Weak<CacheEntry>>,
    superseded: bool,
}

impl FieldValue {
    pub(crate) fn new(value: Value) -> Arc<Self> {
        Arc::new(Self {
            value,
            observers: Mutex::new(Observers::default()),
        })
    }

    /// Registers `entry` as an observer. Returns false if the value has
    /// already been superseded.
    pub(crate) fn subscribe(&self, entry: &Arc<CacheEntry>) -> bool {
        let mut observers = self.observers.lock();
        if observers.superseded {
            return false;
        }
        let ptr = Arc::as_ptr(entry);
        if !observers.caches.iter().any(|w| std::ptr::eq(w.as_ptr(), ptr)) {
            observers.caches.push(Arc::downgrade(entry));
        }
        true
    }

    /// Marks the value superseded and returns its live observers.
    pub(crate) fn supersede(&self) -> Vec<Arc<CacheEntry>> {
        let mut observers = self.observers.lock();
        observers.superseded = true;
        std::mem::take(&mut observers.caches)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.observers.lock().caches.len()
    }
}

impl std::fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FieldValue({:?})", self.value)
    }
}

/// Complete field state of one object as of one applied snapshot.
#[derive(Debug)]
pub(crate) struct Record {
    pub(crate) snapshot: SnapshotId,
    pub(crate) stamp: Stamp,
    prev: Mutex<Option<Arc<Record>>>,
    pub(crate) data: HashMap<FieldKey, Arc<FieldValue>>,
    /// Fields this record changed relative to `prev`.
    pub(crate) changes: BTreeSet<FieldKey>,
    pub(crate) unmounted: bool,
}

impl Record {
    /// The initial record of every object: no fields, stamp zero.
    pub(crate) fn blank() -> Arc<Self> {
        Arc::new(Self {
            snapshot: SnapshotId::new(0),
            stamp: Stamp::ZERO,
            prev: Mutex::new(None),
            data: HashMap::new(),
            changes: BTreeSet::new(),
            unmounted: false,
        })
    }

    pub(crate) fn committed(
        snapshot: SnapshotId,
        stamp: Stamp,
        prev: Arc<Record>,
        data: HashMap<FieldKey, Arc<FieldValue>>,
        changes: BTreeSet<FieldKey>,
        unmounted: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            snapshot,
            stamp,
            prev: Mutex::new(Some(prev)),
            data,
            changes,
            unmounted,
        })
    }

    pub(crate) fn prev(&self) -> Option<Arc<Record>> {
        self.prev.lock().clone()
    }

    /// Drops the link to the previous version.
    pub(crate) fn unlink_prev(&self) {
        self.prev.lock().take();
    }

    pub(crate) fn field(&self, field: &str) -> Option<&Arc<FieldValue>> {
        self.data.get(field)
    }

    /// Returns the newest record in the chain starting at `head` that is
    /// visible to a snapshot started at `at`.
    pub(crate) fn visible(head: &Arc<Record>, at: Stamp) -> Arc<Record> {
        let mut record = Arc::clone(head);
        while record.stamp > at {
            match record.prev() {
                Some(prev) => record = prev,
                None => return Record::blank(),
            }
        }
        record
    }
}

/// Copy-on-write state of one object inside an open snapshot.
pub(crate) struct PendingWrite {
    pub(crate) base: Arc<Record>,
    pub(crate) data: HashMap<FieldKey, Arc<FieldValue>>,
    pub(crate) changes: BTreeSet<FieldKey>,
    pub(crate) unmounted: bool,
}

impl PendingWrite {
    /// Shallow copy of `base`: field value boxes are shared.
    pub(crate) fn new(base: Arc<Record>) -> Self {
        let data = base.data.clone();
        let unmounted = base.unmounted;
        Self {
            base,
            data,
            changes: BTreeSet::new(),
            unmounted,
        }
    }

    /// Writes a field. Returns false if the write is a no-op.
    ///
    /// Writing back the base value restores the base field value box, so
    /// the field no longer counts as changed.
    pub(crate) fn write(&mut self, field: &FieldKey, value: Value) -> bool {
        if let Some(base) = self.base.field(field) {
            if base.value == value {
                let restored = Arc::clone(base);
                let previous = self.data.insert(Arc::clone(field), restored);
                self.changes.remove(field);
                return !previous.is_some_and(|p| Arc::ptr_eq(&p, base));
            }
        }
        if self.changes.contains(field) {
            if let Some(current) = self.data.get(field) {
                if current.value == value {
                    return false;
                }
            }
        }
        self.data.insert(Arc::clone(field), FieldValue::new(value));
        self.changes.insert(Arc::clone(field));
        true
    }

    pub(crate) fn has_changes(&self) -> bool {
        !self.changes.is_empty() || self.unmounted != self.base.unmounted
    }
}
