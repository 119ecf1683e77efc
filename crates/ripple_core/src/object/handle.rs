//! Object handles.

use crate::cache::entry::CacheEntry;
use crate::object::record::Record;
use crate::object::schema::{ObjectType, Operation};
use crate::types::{CacheId, ObjectId};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

pub(crate) struct HandleInner {
    pub(crate) id: ObjectId,
    pub(crate) ty: Arc<ObjectType>,
    hint: String,
    head: RwLock<Arc<Record>>,
    stateless: RwLock<HashMap<String, Value>>,
    caches: Mutex<HashMap<Arc<str>, Arc<CacheEntry>>>,
}

/// Stable identity of one reactive object.
///
/// Cloning a handle clones the reference, not the object. All field access
/// goes through a [`Context`](crate::Context).
#[derive(Clone)]
pub struct ObjectHandle {
    pub(crate) inner: Arc<HandleInner>,
}

impl ObjectHandle {
    pub(crate) fn new(id: ObjectId, ty: Arc<ObjectType>, hint: Option<String>) -> Self {
        let hint = hint.unwrap_or_else(|| format!("{}#{}", ty.name(), id.as_u64()));
        Self {
            inner: Arc::new(HandleInner {
                id,
                ty,
                hint,
                head: RwLock::new(Record::blank()),
                stateless: RwLock::new(HashMap::new()),
                caches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the object ID.
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Returns the object type.
    pub fn object_type(&self) -> &Arc<ObjectType> {
        &self.inner.ty
    }

    /// Returns the diagnostic hint, `Type#id` unless given at creation.
    pub fn hint(&self) -> &str {
        &self.inner.hint
    }

    /// Returns true once an unmount of this object has been committed.
    pub fn is_unmounted(&self) -> bool {
        self.head().unmounted
    }

    /// Reads a stateless member.
    pub fn stateless(&self, name: &str) -> Option<Value> {
        self.inner.stateless.read().get(name).cloned()
    }

    pub(crate) fn set_stateless_unchecked(&self, name: &str, value: Value) {
        self.inner.stateless.write().insert(name.to_string(), value);
    }

    pub(crate) fn head(&self) -> Arc<Record> {
        Arc::clone(&self.inner.head.read())
    }

    pub(crate) fn set_head(&self, record: Arc<Record>) {
        *self.inner.head.write() = record;
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    /// Returns the cache entry of `op`, creating it on first use.
    pub(crate) fn cache_entry(
        &self,
        op: &Arc<Operation>,
        next_id: impl FnOnce() -> CacheId,
    ) -> Arc<CacheEntry> {
        let mut caches = self.inner.caches.lock();
        if let Some(entry) = caches.get(op.name()) {
            return Arc::clone(entry);
        }
        let entry = Arc::new(CacheEntry::new(next_id(), self, Arc::clone(op)));
        caches.insert(Arc::from(op.name()), Arc::clone(&entry));
        entry
    }

    /// Returns the cache entry of `op` if it exists.
    pub(crate) fn existing_cache(&self, op: &str) -> Option<Arc<CacheEntry>> {
        self.inner.caches.lock().get(op).cloned()
    }

    /// Removes every cache entry of this object.
    pub(crate) fn take_caches(&self) -> Vec<Arc<CacheEntry>> {
        self.inner.caches.lock().drain().map(|(_, e)| e).collect()
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ObjectHandle {}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.inner.id)
            .field("hint", &self.inner.hint)
            .finish()
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::options::CacheOptions;

    fn demo_type() -> Arc<ObjectType> {
        ObjectType::builder("Demo")
            .field("title")
            .stateless("label")
            .cached("render", CacheOptions::cached(), |_, _, _| Ok(Value::Null))
            .build()
    }

    #[test]
    fn hint_defaults_to_type_and_id() {
        let h = ObjectHandle::new(ObjectId::new(7), demo_type(), None);
        assert_eq!(h.hint(), "Demo#7");
        assert_eq!(h.to_string(), "Demo#7");
        let named = ObjectHandle::new(ObjectId::new(8), demo_type(), Some("main".into()));
        assert_eq!(named.hint(), "main");
        assert_ne!(h, named);
        assert_eq!(h, h.clone());
    }

    #[test]
    fn cache_entry_is_created_once() {
        let h = ObjectHandle::new(ObjectId::new(1), demo_type(), None);
        let op = Arc::clone(h.object_type().operation("render").unwrap());
        let mut next = 0;
        let a = h.cache_entry(&op, || {
            next += 1;
            CacheId::new(next)
        });
        let b = h.cache_entry(&op, || CacheId::new(99));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id, CacheId::new(1));
        assert!(h.existing_cache("render").is_some());
        assert_eq!(h.take_caches().len(), 1);
        assert!(h.existing_cache("render").is_none());
    }

    #[test]
    fn stateless_members_are_unversioned() {
        let h = ObjectHandle::new(ObjectId::new(1), demo_type(), None);
        assert!(h.stateless("label").is_none());
        h.set_stateless_unchecked("label", Value::from("x"));
        assert_eq!(h.stateless("label"), Some(Value::from("x")));
        assert!(!h.is_unmounted());
    }
}
