//! Snapshots: one transaction's isolated view and write buffer.
//!
//! A snapshot reads the records applied at or before its start stamp plus
//! its own pending writes. At seal time it is rebased onto the current heads
//! and then either applied under the engine commit lock or discarded.

use crate::cache::entry::{args_match, CacheEntry, Observation};
use crate::engine::SnapshotLease;
use crate::error::CoreResult;
use crate::journal::FieldChange;
use crate::object::handle::ObjectHandle;
use crate::object::record::{FieldValue, PendingWrite, Record};
use crate::types::{FieldKey, ObjectId, SnapshotId, Stamp};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Lifecycle of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Reads and writes accumulate.
    Open,
    /// The owning transaction finished its work; awaiting apply.
    Sealed,
    /// Changes were published.
    Applied,
    /// Changes were thrown away.
    Discarded,
}

/// A cache result computed against this snapshot's uncommitted writes.
pub(crate) struct LocalResult {
    pub(crate) entry: Arc<CacheEntry>,
    pub(crate) args: Vec<Value>,
    pub(crate) result: CoreResult<Value>,
    pub(crate) observations: Vec<Observation>,
    pub(crate) deps: Vec<(ObjectId, FieldKey)>,
}

/// What an apply published.
#[derive(Default)]
pub(crate) struct Applied {
    pub(crate) changes: Vec<FieldChange>,
    pub(crate) invalidated: Vec<Arc<CacheEntry>>,
    pub(crate) records: Vec<Arc<Record>>,
    pub(crate) unmounted: Vec<ObjectHandle>,
}

pub(crate) struct Snapshot {
    pub(crate) id: SnapshotId,
    pub(crate) start: Stamp,
    pub(crate) status: SnapshotStatus,
    writes: BTreeMap<ObjectId, (ObjectHandle, PendingWrite)>,
    reads: HashSet<(ObjectId, FieldKey)>,
    local: Vec<LocalResult>,
    created: Vec<ObjectHandle>,
    lease: Option<SnapshotLease>,
}

impl Snapshot {
    pub(crate) fn new(id: SnapshotId, lease: SnapshotLease) -> Self {
        Self {
            id,
            start: lease.start(),
            status: SnapshotStatus::Open,
            writes: BTreeMap::new(),
            reads: HashSet::new(),
            local: Vec::new(),
            created: Vec::new(),
            lease: Some(lease),
        }
    }

    fn visible(&self, handle: &ObjectHandle) -> Arc<Record> {
        Record::visible(&handle.head(), self.start)
    }

    /// Resolves a field. The flag is set when the value came from this
    /// snapshot's own writes.
    pub(crate) fn read(
        &mut self,
        handle: &ObjectHandle,
        field: &FieldKey,
    ) -> (Option<Arc<FieldValue>>, bool) {
        self.reads.insert((handle.id(), Arc::clone(field)));
        if let Some((_, pending)) = self.writes.get(&handle.id()) {
            return (pending.data.get(field).cloned(), true);
        }
        (self.visible(handle).field(field).cloned(), false)
    }

    /// Returns true if the object is unmounted as seen by this snapshot.
    pub(crate) fn is_unmounted(&self, handle: &ObjectHandle) -> bool {
        match self.writes.get(&handle.id()) {
            Some((_, pending)) => pending.unmounted,
            None => self.visible(handle).unmounted,
        }
    }

    fn pending(&mut self, handle: &ObjectHandle) -> &mut PendingWrite {
        let start = self.start;
        &mut self
            .writes
            .entry(handle.id())
            .or_insert_with(|| {
                let base = Record::visible(&handle.head(), start);
                (handle.clone(), PendingWrite::new(base))
            })
            .1
    }

    /// Copy-on-write field write. Returns false for a no-op write.
    pub(crate) fn write(&mut self, handle: &ObjectHandle, field: &FieldKey, value: Value) -> bool {
        let changed = self.pending(handle).write(field, value);
        if changed {
            let object = handle.id();
            self.local
                .retain(|r| !r.deps.iter().any(|(o, f)| *o == object && f == field));
        }
        changed
    }

    pub(crate) fn unmount(&mut self, handle: &ObjectHandle) {
        self.pending(handle).unmounted = true;
    }

    pub(crate) fn created(&mut self, handle: &ObjectHandle) {
        self.created.push(handle.clone());
    }

    /// Returns true if this snapshot changed any of `deps`.
    pub(crate) fn writes_any(&self, deps: &[(ObjectId, FieldKey)]) -> bool {
        deps.iter().any(|(object, field)| {
            self.writes
                .get(object)
                .is_some_and(|(_, pending)| pending.changes.contains(field))
        })
    }

    /// Returns true if this snapshot has anything to apply.
    pub(crate) fn has_changes(&self) -> bool {
        self.writes.values().any(|(_, p)| p.has_changes())
    }

    pub(crate) fn read_set(&self) -> Vec<(ObjectId, FieldKey)> {
        let mut reads: Vec<_> = self.reads.iter().cloned().collect();
        reads.sort();
        reads
    }

    pub(crate) fn local_hit(
        &self,
        entry: &Arc<CacheEntry>,
        args: &[Value],
        sensitive: bool,
    ) -> Option<&LocalResult> {
        self.local
            .iter()
            .find(|r| Arc::ptr_eq(&r.entry, entry) && args_match(&r.args, args, sensitive))
    }

    pub(crate) fn remember(&mut self, result: LocalResult) {
        self.local.retain(|r| !Arc::ptr_eq(&r.entry, &result.entry));
        self.local.push(result);
    }

    pub(crate) fn take_local_results(&mut self) -> Vec<LocalResult> {
        std::mem::take(&mut self.local)
    }

    pub(crate) fn take_created(&mut self) -> Vec<ObjectHandle> {
        std::mem::take(&mut self.created)
    }

    /// Finds fields changed both here and by a snapshot applied since this
    /// one's base records. Returns them as `Type.field`.
    pub(crate) fn rebase(&self) -> Vec<String> {
        let mut conflicts = Vec::new();
        for (handle, pending) in self.writes.values() {
            let head = handle.head();
            if Arc::ptr_eq(&head, &pending.base) {
                continue;
            }
            let ty = handle.object_type().name();
            for field in &pending.changes {
                let theirs = head.field(field).map(|fv| &fv.value);
                let base = pending.base.field(field).map(|fv| &fv.value);
                if theirs != base {
                    conflicts.push(format!("{ty}.{field}"));
                }
            }
            if head.unmounted && !pending.base.unmounted && pending.has_changes() {
                conflicts.push(format!("{ty}.<unmounted>"));
            }
        }
        conflicts
    }

    /// Publishes every pending write on top of the current heads.
    ///
    /// Must run under the engine commit lock. Fields changed on both sides
    /// take this snapshot's value.
    pub(crate) fn apply(&mut self, stamp: Stamp) -> Applied {
        let mut applied = Applied::default();
        for (object, (handle, pending)) in std::mem::take(&mut self.writes) {
            let head = handle.head();
            let mut data = head.data.clone();
            let mut changed = BTreeSet::new();
            for field in &pending.changes {
                let Some(new) = pending.data.get(field) else {
                    continue;
                };
                let old = head.field(field);
                if old.is_some_and(|old| old.value == new.value) {
                    continue;
                }
                applied.changes.push(FieldChange {
                    object,
                    field: Arc::clone(field),
                    old: old.map(|fv| fv.value.clone()),
                    new: new.value.clone(),
                });
                data.insert(Arc::clone(field), Arc::clone(new));
                changed.insert(Arc::clone(field));
            }
            let unmount = pending.unmounted && !head.unmounted;
            if changed.is_empty() && !unmount {
                continue;
            }

            let record = Record::committed(
                self.id,
                stamp,
                Arc::clone(&head),
                data,
                changed,
                head.unmounted || pending.unmounted,
            );
            handle.set_head(Arc::clone(&record));
            for field in &record.changes {
                if let Some(old) = head.field(field) {
                    applied.invalidated.extend(old.supersede());
                }
            }
            applied.records.push(record);
            if unmount {
                applied.unmounted.push(handle);
            }
        }
        self.status = SnapshotStatus::Applied;
        applied
    }

    /// Throws away every pending write and local result.
    pub(crate) fn discard(&mut self) {
        self.writes.clear();
        self.local.clear();
        self.created.clear();
        self.status = SnapshotStatus::Discarded;
    }

    /// Ends the snapshot's registration as an active reader.
    pub(crate) fn release(&mut self) {
        self.lease.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::object::schema::ObjectType;

    fn setup() -> (Engine, ObjectHandle) {
        let engine = Engine::new();
        let ty = ObjectType::builder("Demo").field("title").field("users").build();
        let handle = engine
            .transaction("create", |ctx| {
                ctx.create(&ty, [("title", Value::from("Demo")), ("users", Value::from(0i64))])
            })
            .unwrap();
        (engine, handle)
    }

    fn key(name: &str) -> FieldKey {
        Arc::from(name)
    }

    #[test]
    fn reads_see_own_writes_first() {
        let (engine, handle) = setup();
        let mut snapshot = engine.inner.acquire_snapshot();
        let title = key("title");

        let (fv, local) = snapshot.read(&handle, &title);
        assert_eq!(fv.unwrap().value, Value::from("Demo"));
        assert!(!local);

        assert!(snapshot.write(&handle, &title, Value::from("Draft")));
        let (fv, local) = snapshot.read(&handle, &title);
        assert_eq!(fv.unwrap().value, Value::from("Draft"));
        assert!(local);
        assert!(snapshot.writes_any(&[(handle.id(), title.clone())]));
        assert_eq!(snapshot.read_set().len(), 1);
    }

    #[test]
    fn rebase_reports_fields_changed_on_both_sides() {
        let (engine, handle) = setup();
        let mut older = engine.inner.acquire_snapshot();
        older.write(&handle, &key("title"), Value::from("mine"));
        older.write(&handle, &key("users"), Value::from(1i64));

        engine
            .transaction("theirs", |ctx| ctx.set(&handle, "title", "theirs"))
            .unwrap();

        assert_eq!(older.rebase(), vec!["Demo.title".to_string()]);
    }

    #[test]
    fn apply_merges_onto_newer_head() {
        let (engine, handle) = setup();
        let mut older = engine.inner.acquire_snapshot();
        older.write(&handle, &key("users"), Value::from(5i64));

        engine
            .transaction("title", |ctx| ctx.set(&handle, "title", "Updated"))
            .unwrap();

        assert!(older.rebase().is_empty());
        let applied = older.apply(Stamp::new(99));
        assert_eq!(applied.changes.len(), 1);
        assert_eq!(applied.records.len(), 1);

        let head = handle.head();
        assert_eq!(head.field("title").unwrap().value, Value::from("Updated"));
        assert_eq!(head.field("users").unwrap().value, Value::from(5i64));
        assert_eq!(older.status, SnapshotStatus::Applied);
    }

    #[test]
    fn restoring_a_value_leaves_nothing_to_apply() {
        let (engine, handle) = setup();
        let mut snapshot = engine.inner.acquire_snapshot();
        snapshot.write(&handle, &key("title"), Value::from("x"));
        snapshot.write(&handle, &key("title"), Value::from("Demo"));
        assert!(!snapshot.has_changes());
        assert!(snapshot.apply(Stamp::new(50)).records.is_empty());
    }
}
