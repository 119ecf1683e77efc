//! Execution context: the accessor layer through which every field read and
//! write is attributed to a transaction and, inside a cache evaluation, to
//! the evaluating cache entry.

use crate::cache::entry::{CacheEntry, Observation};
use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::object::handle::ObjectHandle;
use crate::object::schema::ObjectType;
use crate::snapshot::Snapshot;
use crate::transaction::Transaction;
use crate::types::{FieldKey, ObjectId};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Observations collected by one cache evaluation.
pub(crate) struct Frame {
    pub(crate) entry: Arc<CacheEntry>,
    observations: Mutex<Vec<Observation>>,
    own_writes: Mutex<Vec<(ObjectId, FieldKey)>>,
    local: AtomicBool,
    no_side_effects: bool,
}

impl Frame {
    pub(crate) fn new(entry: Arc<CacheEntry>, no_side_effects: bool) -> Arc<Self> {
        Arc::new(Self {
            entry,
            observations: Mutex::new(Vec::new()),
            own_writes: Mutex::new(Vec::new()),
            local: AtomicBool::new(false),
            no_side_effects,
        })
    }

    /// Records a read. `local` marks reads served by uncommitted writes.
    pub(crate) fn observe(&self, observation: Observation, local: bool) {
        if let Observation::Cache { entry, .. } = &observation {
            if Arc::ptr_eq(entry, &self.entry) {
                return;
            }
        }
        if local {
            self.local.store(true, Ordering::Relaxed);
        }
        self.observations.lock().push(observation);
    }

    fn wrote(&self, object: ObjectId, field: &FieldKey) {
        self.local.store(true, Ordering::Relaxed);
        let mut own = self.own_writes.lock();
        if !own.iter().any(|(o, f)| *o == object && f == field) {
            own.push((object, Arc::clone(field)));
        }
    }

    pub(crate) fn no_side_effects(&self) -> bool {
        self.no_side_effects
    }

    /// Ends the evaluation.
    ///
    /// Returns the observations as made, the same observations with fields
    /// this frame wrote re-pointed at the snapshot's current values (so an
    /// evaluation is never invalidated by its own writes), and whether any
    /// of them depends on uncommitted state.
    pub(crate) fn finish(&self, snapshot: &mut Snapshot) -> (Vec<Observation>, Vec<Observation>, bool) {
        let own = std::mem::take(&mut *self.own_writes.lock());
        let raw = std::mem::take(&mut *self.observations.lock());
        let mut resolved = raw.clone();
        if !own.is_empty() {
            for observation in &mut resolved {
                if let Observation::Field { handle, field, value } = observation {
                    if !own.iter().any(|(o, f)| *o == handle.id() && f == field) {
                        continue;
                    }
                    if let (Some(current), _) = snapshot.read(handle, field) {
                        *value = current;
                    }
                }
            }
        }
        (raw, resolved, self.local.load(Ordering::Relaxed))
    }
}

/// Handle for work inside a transaction.
///
/// Cloning a context is cheap; clones share the transaction and, inside a
/// cache evaluation, the evaluating entry.
#[derive(Clone)]
pub struct Context {
    txn: Arc<Transaction>,
    frame: Option<Arc<Frame>>,
}

impl Context {
    pub(crate) fn new(txn: Arc<Transaction>) -> Self {
        Self { txn, frame: None }
    }

    pub(crate) fn with_frame(&self, frame: Arc<Frame>) -> Self {
        Self {
            txn: Arc::clone(&self.txn),
            frame: Some(frame),
        }
    }

    pub(crate) fn without_frame(&self) -> Self {
        Self::new(Arc::clone(&self.txn))
    }

    pub(crate) fn frame(&self) -> Option<&Arc<Frame>> {
        self.frame.as_ref()
    }

    /// Returns the transaction this context works in.
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }

    /// Returns the engine.
    pub fn engine(&self) -> &Engine {
        self.txn.engine()
    }

    /// Returns true once the transaction was canceled.
    pub fn is_canceled(&self) -> bool {
        self.txn.is_canceled()
    }

    /// Reads a reactive field.
    ///
    /// Inside a cache evaluation the read becomes a dependency of the
    /// evaluating entry.
    pub fn get(&self, handle: &ObjectHandle, field: &str) -> CoreResult<Value> {
        let ty = handle.object_type();
        let key = ty
            .field(field)
            .ok_or_else(|| CoreError::unknown_field(ty.name(), field))?;
        if self.txn.is_finished() {
            return Err(CoreError::sealed(self.txn.id(), self.txn.hint()));
        }

        let (value, local) = self.txn.snapshot.lock().read(handle, key);
        let value = value.ok_or_else(|| CoreError::uninitialized_field(ty.name(), field))?;
        self.txn.stats().record_read();
        trace!(snapshot = %self.txn.id(), object = %handle, field, "read");

        if let Some(frame) = &self.frame {
            frame.observe(
                Observation::Field {
                    handle: handle.clone(),
                    field: Arc::clone(key),
                    value: Arc::clone(&value),
                },
                local,
            );
        }
        Ok(value.value.clone())
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.txn.is_read_only() {
            return Err(CoreError::invalid_operation(
                "cannot make changes outside of a transaction",
            ));
        }
        if let Some(frame) = self.frame.as_ref().filter(|f| f.no_side_effects) {
            return Err(CoreError::invalid_operation(format!(
                "{} has no side effects and cannot change state",
                frame.entry.hint()
            )));
        }
        self.txn.check_running()
    }

    /// Writes a reactive field in this transaction's snapshot.
    pub fn set(&self, handle: &ObjectHandle, field: &str, value: impl Into<Value>) -> CoreResult<()> {
        let ty = handle.object_type();
        let key = ty
            .field(field)
            .ok_or_else(|| CoreError::unknown_field(ty.name(), field))?;
        self.check_writable()?;

        let value = value.into();
        let hint = value.hint();
        let changed = {
            let mut snapshot = self.txn.snapshot.lock();
            if snapshot.is_unmounted(handle) {
                return Err(CoreError::unmounted(handle.hint()));
            }
            snapshot.write(handle, key, value)
        };
        if let Some(frame) = &self.frame {
            frame.wrote(handle.id(), key);
        }
        self.txn.stats().record_write();
        trace!(snapshot = %self.txn.id(), object = %handle, field, value = %hint, changed, "write");
        Ok(())
    }

    /// Reads, mutates and writes back a field.
    ///
    /// Collections are shared with committed records; the first mutation
    /// copies them.
    pub fn update(
        &self,
        handle: &ObjectHandle,
        field: &str,
        f: impl FnOnce(&mut Value),
    ) -> CoreResult<()> {
        let mut value = self.get(handle, field)?;
        f(&mut value);
        self.set(handle, field, value)
    }

    /// Creates an object. Fields left out of `init` stay uninitialized
    /// until first assigned.
    pub fn create<'a>(
        &self,
        ty: &Arc<ObjectType>,
        init: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> CoreResult<ObjectHandle> {
        self.create_inner(ty, None, init)
    }

    /// Creates an object with a diagnostic hint.
    pub fn create_named<'a>(
        &self,
        ty: &Arc<ObjectType>,
        hint: impl Into<String>,
        init: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> CoreResult<ObjectHandle> {
        self.create_inner(ty, Some(hint.into()), init)
    }

    fn create_inner<'a>(
        &self,
        ty: &Arc<ObjectType>,
        hint: Option<String>,
        init: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> CoreResult<ObjectHandle> {
        self.check_writable()?;
        let mut fields = Vec::new();
        for (name, value) in init {
            let key = ty
                .field(name)
                .ok_or_else(|| CoreError::unknown_field(ty.name(), name))?;
            fields.push((Arc::clone(key), value));
        }

        let handle = ObjectHandle::new(self.engine().next_object_id(), Arc::clone(ty), hint);
        {
            let mut snapshot = self.txn.snapshot.lock();
            for (key, value) in fields {
                snapshot.write(&handle, &key, value);
                if let Some(frame) = &self.frame {
                    frame.wrote(handle.id(), &key);
                }
            }
            snapshot.created(&handle);
        }
        trace!(snapshot = %self.txn.id(), object = %handle, "create");
        Ok(handle)
    }

    /// Unmounts an object. After commit its caches are destroyed and its
    /// triggers never run again.
    pub fn unmount(&self, handle: &ObjectHandle) -> CoreResult<()> {
        self.check_writable()?;
        self.txn.snapshot.lock().unmount(handle);
        trace!(snapshot = %self.txn.id(), object = %handle, "unmount");
        Ok(())
    }

    /// Reads a stateless member.
    pub fn stateless(&self, handle: &ObjectHandle, name: &str) -> CoreResult<Option<Value>> {
        let ty = handle.object_type();
        if !ty.is_stateless(name) {
            return Err(CoreError::unknown_field(ty.name(), name));
        }
        Ok(handle.stateless(name))
    }

    /// Writes a stateless member. Stateless members are neither versioned
    /// nor tracked, so the write is visible immediately and invalidates
    /// nothing.
    pub fn set_stateless(
        &self,
        handle: &ObjectHandle,
        name: &str,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        let ty = handle.object_type();
        if !ty.is_stateless(name) {
            return Err(CoreError::unknown_field(ty.name(), name));
        }
        handle.set_stateless_unchecked(name, value.into());
        Ok(())
    }

    /// Runs nested work in this transaction.
    ///
    /// An error cancels the whole transaction.
    pub fn run<T>(&self, f: impl FnOnce(&Context) -> CoreResult<T>) -> CoreResult<T> {
        let _worker = self.txn.enter()?;
        let result = f(self);
        if let Err(err) = &result {
            self.txn.cancel(err.clone(), None);
        }
        result
    }

    /// Runs `f` without recording its reads as dependencies of the
    /// enclosing cache evaluation.
    ///
    /// Reads still see this transaction's snapshot and own writes.
    pub fn untracked<T>(&self, f: impl FnOnce(&Context) -> CoreResult<T>) -> CoreResult<T> {
        f(&self.without_frame())
    }

    /// Runs `f` in a root transaction of its own.
    ///
    /// The work applies or fails independently of this transaction, and
    /// this transaction's snapshot does not see it.
    pub fn isolated<T>(&self, f: impl FnOnce(&Context) -> CoreResult<T>) -> CoreResult<T> {
        let hint = format!("{} (isolated)", self.txn.hint());
        self.engine().transaction(&hint, f)
    }

    /// Records the read of another cache entry's result.
    pub(crate) fn observe_cache(&self, entry: &Arc<CacheEntry>, result: &CoreResult<Value>, local: bool) {
        if let Some(frame) = &self.frame {
            frame.observe(
                Observation::Cache {
                    entry: Arc::clone(entry),
                    result: result.clone(),
                },
                local,
            );
        }
    }
}
