//! Cache entries: memoized results with tracked dependencies.

use crate::cache::options::CacheOptions;
use crate::error::{CoreError, CoreResult};
use crate::object::handle::{HandleInner, ObjectHandle};
use crate::object::record::FieldValue;
use crate::object::schema::Operation;
use crate::reentrance::InFlight;
use crate::types::{CacheId, FieldKey, ObjectId, Stamp};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// One read made during an evaluation.
#[derive(Clone)]
pub(crate) enum Observation {
    /// A field value box.
    Field {
        handle: ObjectHandle,
        field: FieldKey,
        value: Arc<FieldValue>,
    },
    /// The result of another cache entry.
    Cache {
        entry: Arc<CacheEntry>,
        result: CoreResult<Value>,
    },
}

/// Collects the transitive field dependencies of a set of observations.
pub(crate) fn dependencies(observations: &[Observation]) -> Vec<(ObjectId, FieldKey)> {
    let mut deps: Vec<(ObjectId, FieldKey)> = Vec::new();
    for observation in observations {
        match observation {
            Observation::Field { handle, field, .. } => deps.push((handle.id(), Arc::clone(field))),
            Observation::Cache { entry, .. } => deps.extend(entry.deps()),
        }
    }
    deps.sort();
    deps.dedup();
    deps
}

pub(crate) struct EntryState {
    pub(crate) result: Option<CoreResult<Value>>,
    pub(crate) args: Vec<Value>,
    pub(crate) valid: bool,
    pub(crate) computed_at: Stamp,
    pub(crate) deps: Vec<(ObjectId, FieldKey)>,
    observers: Vec<Weak<CacheEntry>>,
    pub(crate) in_flight: Vec<InFlight>,
    pub(crate) next_token: u64,
    pub(crate) last_run: Option<Instant>,
    pub(crate) retired: bool,
}

/// Memoized state of one operation on one object.
pub(crate) struct CacheEntry {
    pub(crate) id: CacheId,
    pub(crate) object: ObjectId,
    handle: Weak<HandleInner>,
    pub(crate) op: Arc<Operation>,
    options: RwLock<CacheOptions>,
    pub(crate) state: Mutex<EntryState>,
}

impl CacheEntry {
    pub(crate) fn new(id: CacheId, handle: &ObjectHandle, op: Arc<Operation>) -> Self {
        Self {
            id,
            object: handle.id(),
            handle: handle.downgrade(),
            options: RwLock::new(op.options().clone()),
            op,
            state: Mutex::new(EntryState {
                result: None,
                args: Vec::new(),
                valid: false,
                computed_at: Stamp::ZERO,
                deps: Vec::new(),
                observers: Vec::new(),
                in_flight: Vec::new(),
                next_token: 0,
                last_run: None,
                retired: false,
            }),
        }
    }

    pub(crate) fn handle(&self) -> Option<ObjectHandle> {
        self.handle.upgrade().map(ObjectHandle::from_inner)
    }

    /// `Type#id.op`, used in transaction hints and errors.
    pub(crate) fn hint(&self) -> String {
        match self.handle() {
            Some(h) => format!("{}.{}", h.hint(), self.op.name()),
            None => self.op.qualified_name(),
        }
    }

    pub(crate) fn options(&self) -> CacheOptions {
        self.options.read().clone()
    }

    pub(crate) fn configure(&self, f: impl FnOnce(&mut CacheOptions)) {
        let mut options = self.options.write();
        let kind = options.kind;
        f(&mut options);
        options.kind = kind;
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub(crate) fn deps(&self) -> Vec<(ObjectId, FieldKey)> {
        self.state.lock().deps.clone()
    }

    /// Returns the memoized result when it can serve a snapshot started at
    /// `start`, together with its dependencies.
    pub(crate) fn hit(
        &self,
        args: &[Value],
        sensitive: bool,
        start: Stamp,
    ) -> Option<(CoreResult<Value>, Vec<(ObjectId, FieldKey)>)> {
        let state = self.state.lock();
        if !state.valid || start < state.computed_at || !args_match(&state.args, args, sensitive) {
            return None;
        }
        let result = state.result.clone()?;
        Some((result, state.deps.clone()))
    }

    /// Marks the entry invalid. Returns the dependent entries to cascade
    /// to, or `None` if it was already invalid.
    pub(crate) fn mark_invalid(&self) -> Option<Vec<Arc<CacheEntry>>> {
        let mut state = self.state.lock();
        if !state.valid {
            return None;
        }
        state.valid = false;
        Some(
            std::mem::take(&mut state.observers)
                .iter()
                .filter_map(Weak::upgrade)
                .collect(),
        )
    }

    /// Subscribes `outer` to this entry if it still holds `observed`.
    pub(crate) fn subscribe(self: &Arc<Self>, outer: &Arc<CacheEntry>, observed: &CoreResult<Value>) -> Option<Stamp> {
        let mut state = self.state.lock();
        if !state.valid || state.result.as_ref() != Some(observed) {
            return None;
        }
        let ptr = Arc::as_ptr(outer);
        if !state.observers.iter().any(|w| std::ptr::eq(w.as_ptr(), ptr)) {
            state.observers.push(Arc::downgrade(outer));
        }
        Some(state.computed_at)
    }

    /// Stores an evaluation result and subscribes to its dependencies.
    ///
    /// Each observation is resolved against the current head: a field that
    /// no longer holds the observed value makes the result stale, and the
    /// entry is stored invalid. A valid result computed by a newer snapshot
    /// is kept unless `force` is set. Returns the resulting validity.
    pub(crate) fn publish(
        self: &Arc<Self>,
        args: Vec<Value>,
        result: CoreResult<Value>,
        observations: &[Observation],
        floor: Stamp,
        applied: Stamp,
        force: bool,
    ) -> bool {
        let deps = dependencies(observations);
        let mut state = self.state.lock();
        if state.retired {
            return false;
        }
        if !force && state.valid && state.computed_at > floor {
            return true;
        }

        let mut valid = true;
        let mut unchanged = true;
        let mut computed_at = floor;
        for observation in observations {
            match observation {
                Observation::Field { handle, field, value } => {
                    let head = handle.head();
                    match head.field(field) {
                        Some(current) if Arc::ptr_eq(current, value) => {
                            valid = current.subscribe(self);
                        }
                        Some(current) if current.value == value.value => {
                            unchanged = false;
                            valid = current.subscribe(self);
                        }
                        _ => valid = false,
                    }
                }
                Observation::Cache { entry, result } => match entry.subscribe(self, result) {
                    Some(at) => computed_at = computed_at.max(at),
                    None => valid = false,
                },
            }
            if !valid {
                break;
            }
        }
        if !unchanged {
            computed_at = computed_at.max(applied);
        }

        state.result = Some(result);
        state.args = args;
        state.valid = valid;
        state.computed_at = computed_at;
        state.deps = deps;
        valid
    }

    /// Stores a failed evaluation as invalid so the next invocation retries.
    /// A valid result computed by a newer snapshot is kept.
    pub(crate) fn record_failure(&self, args: Vec<Value>, error: CoreError, floor: Stamp) {
        let mut state = self.state.lock();
        if state.retired || (state.valid && state.computed_at > floor) {
            return;
        }
        state.result = Some(Err(error));
        state.args = args;
        state.valid = false;
    }

    /// Records a result without memoizing it.
    pub(crate) fn record_result(&self, args: Vec<Value>, result: CoreResult<Value>) {
        let mut state = self.state.lock();
        state.result = Some(result);
        state.args = args;
    }

    pub(crate) fn last_result(&self) -> Option<CoreResult<Value>> {
        self.state.lock().result.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.state.lock().in_flight.is_empty()
    }

    pub(crate) fn touch(&self) {
        self.state.lock().last_run = Some(Instant::now());
    }

    pub(crate) fn last_run(&self) -> Option<Instant> {
        self.state.lock().last_run
    }

    /// Detaches the entry from its unmounted object.
    pub(crate) fn retire(&self) -> Vec<Arc<CacheEntry>> {
        let observers = self.mark_invalid().unwrap_or_default();
        let mut state = self.state.lock();
        state.retired = true;
        state.deps.clear();
        observers
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.state.lock().retired
    }
}

/// Compares argument tuples by value (`sensitive`) or by identity.
pub(crate) fn args_match(a: &[Value], b: &[Value], sensitive: bool) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            if sensitive {
                x == y
            } else {
                x.is_identical(y)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::record::{PendingWrite, Record};
    use crate::object::schema::ObjectType;
    use crate::types::SnapshotId;
    use std::collections::BTreeSet;

    fn setup() -> (ObjectHandle, Arc<CacheEntry>) {
        let ty = ObjectType::builder("Demo")
            .field("title")
            .cached("render", CacheOptions::cached(), |_, _, _| Ok(Value::Null))
            .build();
        let handle = ObjectHandle::new(ObjectId::new(1), ty, None);
        let op = Arc::clone(handle.object_type().operation("render").unwrap());
        let entry = handle.cache_entry(&op, || CacheId::new(1));
        (handle, entry)
    }

    fn commit_title(handle: &ObjectHandle, stamp: u64, title: &str) {
        let head = handle.head();
        let mut pending = PendingWrite::new(Arc::clone(&head));
        let key: FieldKey = Arc::from("title");
        pending.write(&key, Value::from(title));
        let record = Record::committed(
            SnapshotId::new(stamp),
            Stamp::new(stamp),
            head,
            pending.data,
            BTreeSet::from([key]),
            false,
        );
        handle.set_head(record);
    }

    fn observe(handle: &ObjectHandle) -> Observation {
        let field: FieldKey = Arc::from("title");
        let value = Arc::clone(handle.head().field("title").unwrap());
        Observation::Field {
            handle: handle.clone(),
            field,
            value,
        }
    }

    #[test]
    fn publish_subscribes_and_invalidates() {
        let (handle, entry) = setup();
        commit_title(&handle, 1, "Demo");
        let obs = observe(&handle);

        assert!(entry.publish(vec![], Ok(Value::from("x")), &[obs], Stamp::new(1), Stamp::new(1), false));
        assert!(entry.is_valid());
        assert!(entry.hit(&[], false, Stamp::new(1)).is_some());
        assert!(entry.hit(&[], false, Stamp::ZERO).is_none());

        let old = Arc::clone(handle.head().field("title").unwrap());
        let observers = old.supersede();
        assert_eq!(observers.len(), 1);
        assert!(observers[0].mark_invalid().is_some());
        assert!(!entry.is_valid());
        assert!(observers[0].mark_invalid().is_none());
    }

    #[test]
    fn stale_observation_publishes_invalid() {
        let (handle, entry) = setup();
        commit_title(&handle, 1, "Demo");
        let obs = observe(&handle);
        commit_title(&handle, 2, "Updated");

        assert!(!entry.publish(vec![], Ok(Value::Null), &[obs], Stamp::new(1), Stamp::new(2), false));
        assert!(!entry.is_valid());
        assert_eq!(entry.last_result(), Some(Ok(Value::Null)));
    }

    #[test]
    fn equal_value_in_new_box_moves_computed_at() {
        let (handle, entry) = setup();
        commit_title(&handle, 1, "Demo");
        let obs = observe(&handle);
        commit_title(&handle, 2, "Other");
        commit_title(&handle, 3, "Demo");

        assert!(entry.publish(vec![], Ok(Value::Null), &[obs], Stamp::new(1), Stamp::new(3), false));
        assert!(entry.hit(&[], false, Stamp::new(2)).is_none());
        assert!(entry.hit(&[], false, Stamp::new(3)).is_some());
    }

    #[test]
    fn failure_keeps_newer_valid_result() {
        let (handle, entry) = setup();
        commit_title(&handle, 1, "Demo");
        entry.publish(vec![], Ok(Value::from("ok")), &[observe(&handle)], Stamp::new(2), Stamp::new(2), false);

        entry.record_failure(vec![], CoreError::failed("older"), Stamp::new(1));
        assert!(entry.is_valid());
        assert_eq!(entry.last_result(), Some(Ok(Value::from("ok"))));

        entry.record_failure(vec![], CoreError::failed("newer"), Stamp::new(2));
        assert!(!entry.is_valid());
        assert_eq!(entry.last_result(), Some(Err(CoreError::failed("newer"))));
    }

    #[test]
    fn args_identity_versus_value() {
        let a = vec![Value::from("k")];
        let b = vec![Value::from("k")];
        assert!(args_match(&a, &b, true));
        assert!(!args_match(&a, &b, false));
        assert!(args_match(&a, &a.clone(), false));
        assert!(!args_match(&a, &[], true));
    }

    #[test]
    fn retire_detaches() {
        let (handle, entry) = setup();
        commit_title(&handle, 1, "Demo");
        entry.publish(vec![], Ok(Value::Null), &[observe(&handle)], Stamp::new(1), Stamp::new(1), false);
        entry.retire();
        assert!(entry.is_retired());
        assert!(!entry.is_valid());
        assert!(!entry.publish(vec![], Ok(Value::Null), &[], Stamp::new(2), Stamp::new(2), true));
    }
}
