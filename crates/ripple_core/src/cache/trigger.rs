//! Trigger scheduling.
//!
//! Invalidated triggers wait in a queue until they are due (throttling) and
//! run in priority order, highest first, ties broken by cache ID. The queue
//! is drained after every applied transaction. Synchronous triggers run
//! inline as root transactions; asynchronous ones are spawned on the
//! ambient tokio runtime.

use crate::cache::entry::CacheEntry;
use crate::cache::options::Throttling;
use crate::engine::Engine;
use crate::object::schema::Body;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Pending triggers.
pub(crate) struct TriggerQueue {
    pending: Mutex<Vec<Arc<CacheEntry>>>,
    draining: AtomicBool,
}

/// When a pending trigger may run. `None` means now.
fn due_at(entry: &CacheEntry) -> Option<Instant> {
    match entry.options().throttling {
        Throttling::Delay(delay) => entry.last_run().map(|last| last + delay),
        Throttling::Immediate | Throttling::Never => None,
    }
}

/// Orders by priority, then by the lower cache ID.
fn runs_before(a: &CacheEntry, b: &CacheEntry) -> CmpOrdering {
    a.options()
        .priority
        .cmp(&b.options().priority)
        .then_with(|| b.id.cmp(&a.id))
}

impl TriggerQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Queues a trigger. Triggers throttled to `Never` are not queued.
    pub(crate) fn push(&self, entry: Arc<CacheEntry>) -> bool {
        if entry.options().throttling == Throttling::Never {
            return false;
        }
        let mut pending = self.pending.lock();
        if pending.iter().any(|e| e.id == entry.id) {
            return false;
        }
        pending.push(entry);
        true
    }

    /// Removes and returns the next due trigger.
    pub(crate) fn pop_due(&self, now: Instant) -> Option<Arc<CacheEntry>> {
        let mut pending = self.pending.lock();
        let index = pending
            .iter()
            .enumerate()
            .filter(|(_, e)| due_at(e).map_or(true, |at| at <= now))
            .max_by(|(_, a), (_, b)| runs_before(a, b))
            .map(|(i, _)| i)?;
        Some(pending.remove(index))
    }

    pub(crate) fn has_due(&self, now: Instant) -> bool {
        self.pending
            .lock()
            .iter()
            .any(|e| due_at(e).map_or(true, |at| at <= now))
    }

    /// Earliest time a pending trigger becomes due.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let now = Instant::now();
        self.pending
            .lock()
            .iter()
            .map(|e| due_at(e).unwrap_or(now))
            .min()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let n = pending.len();
        pending.clear();
        n
    }
}

impl Engine {
    /// Queues triggers for the next drain.
    pub(crate) fn schedule(&self, entries: Vec<Arc<CacheEntry>>) {
        for entry in entries {
            self.inner.triggers.push(entry);
        }
    }

    /// Returns the number of queued triggers, due or not.
    pub fn pending_triggers(&self) -> usize {
        self.inner.triggers.len()
    }

    /// Runs every due trigger, including the ones their runs invalidate.
    ///
    /// Returns the number of triggers started. A call made while another
    /// drain is in progress returns immediately; the running drain picks up
    /// the new work.
    pub fn run_pending_triggers(&self) -> usize {
        let queue = &self.inner.triggers;
        let limit = self.config().max_trigger_cascade;
        let mut ran = 0;
        loop {
            if queue.draining.swap(true, Ordering::AcqRel) {
                return ran;
            }
            let mut runs = 0;
            while let Some(entry) = queue.pop_due(Instant::now()) {
                if runs >= limit {
                    let dropped = queue.clear() + 1;
                    error!(limit, dropped, "trigger cascade limit reached; remaining triggers left invalid");
                    break;
                }
                if self.run_trigger(entry) {
                    runs += 1;
                }
            }
            queue.draining.store(false, Ordering::Release);
            ran += runs;
            if !queue.has_due(Instant::now()) {
                return ran;
            }
        }
    }

    /// Runs triggers as they become due until the queue is empty.
    pub async fn drive_triggers(&self) {
        loop {
            self.run_pending_triggers();
            let Some(deadline) = self.inner.triggers.next_deadline() else {
                return;
            };
            if deadline <= Instant::now() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            }
        }
    }

    fn run_trigger(&self, entry: Arc<CacheEntry>) -> bool {
        let Some(handle) = entry.handle() else {
            return false;
        };
        if entry.is_retired() || handle.is_unmounted() || entry.is_valid() {
            return false;
        }
        entry.touch();
        self.stats().record_trigger_run();
        debug!(trigger = %entry.hint(), "running trigger");

        match &entry.op.body {
            Body::Sync(_) => {
                if let Err(err) = self.invoke_root(&handle, &entry, Vec::new()) {
                    debug!(trigger = %entry.hint(), error = %err, "trigger run ended with error");
                }
            }
            Body::Async(_) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let engine = self.clone();
                    runtime.spawn(async move {
                        let hint = entry.hint();
                        if let Err(err) = engine.invoke_root_async(handle, entry, Vec::new()).await {
                            debug!(trigger = %hint, error = %err, "trigger run ended with error");
                        }
                    });
                }
                Err(_) => {
                    error!(trigger = %entry.hint(), "no tokio runtime to run asynchronous trigger");
                    return false;
                }
            },
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::options::CacheOptions;
    use crate::error::CoreResult;
    use crate::object::schema::ObjectType;
    use crate::transaction::Context;
    use crate::value::Value;
    use crate::object::handle::ObjectHandle;
    use std::time::Duration;

    fn log_type(log: Arc<Mutex<Vec<String>>>) -> Arc<ObjectType> {
        let low = Arc::clone(&log);
        let high = Arc::clone(&log);
        ObjectType::builder("Watched")
            .field("value")
            .field("mirror")
            .trigger("low", CacheOptions::trigger().priority(1), move |ctx, this, _| {
                let value = ctx.get(this, "value")?;
                low.lock().push(format!("low:{value}"));
                Ok(Value::Null)
            })
            .trigger("high", CacheOptions::trigger().priority(5), move |ctx, this, _| {
                let value = ctx.get(this, "value")?;
                high.lock().push(format!("high:{value}"));
                Ok(Value::Null)
            })
            .trigger("mirror", CacheOptions::trigger(), |ctx, this, _| {
                let value = ctx.get(this, "value")?;
                ctx.set(this, "mirror", value)?;
                Ok(Value::Null)
            })
            .build()
    }

    fn create(engine: &Engine, ty: &Arc<ObjectType>) -> ObjectHandle {
        engine
            .transaction("create", |ctx| {
                ctx.create(ty, [("value", Value::from(1i64)), ("mirror", Value::Null)])
            })
            .unwrap()
    }

    #[test]
    fn triggers_run_by_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ty = log_type(Arc::clone(&log));
        let engine = Engine::new();
        let handle = create(&engine, &ty);
        assert_eq!(*log.lock(), vec!["high:1".to_string(), "low:1".to_string()]);

        log.lock().clear();
        engine
            .transaction("bump", |ctx| ctx.set(&handle, "value", 2i64))
            .unwrap();
        assert_eq!(*log.lock(), vec!["high:2".to_string(), "low:2".to_string()]);
    }

    #[test]
    fn trigger_writes_are_committed_and_do_not_retrigger() {
        let engine = Engine::new();
        let handle = create(&engine, &log_type(Arc::new(Mutex::new(Vec::new()))));
        assert_eq!(engine.get(&handle, "mirror").unwrap(), Value::from(1i64));

        let runs_before = engine.stats().triggers_run();
        engine
            .transaction("bump", |ctx| ctx.set(&handle, "value", 7i64))
            .unwrap();
        assert_eq!(engine.get(&handle, "mirror").unwrap(), Value::from(7i64));
        assert_eq!(engine.stats().triggers_run() - runs_before, 3);
        assert_eq!(engine.pending_triggers(), 0);
        assert!(!engine.cache(&handle, "mirror").unwrap().is_invalid());
    }

    #[test]
    fn unmounted_objects_stop_triggering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ty = log_type(Arc::clone(&log));
        let engine = Engine::new();
        let handle = create(&engine, &ty);
        log.lock().clear();

        engine.transaction("unmount", |ctx| ctx.unmount(&handle)).unwrap();
        assert!(log.lock().is_empty());
        assert!(engine.object(handle.id()).is_none());
    }

    #[test]
    fn delayed_trigger_waits_in_queue() {
        let ty = ObjectType::builder("Slow")
            .field("value")
            .trigger(
                "echo",
                CacheOptions::trigger().throttling(Throttling::Delay(Duration::from_secs(3600))),
                |ctx: &Context, this: &ObjectHandle, _: &[Value]| -> CoreResult<Value> {
                    ctx.get(this, "value")
                },
            )
            .build();
        let engine = Engine::new();
        let handle = create_slow(&engine, &ty);
        // First run is immediate: there is no previous run to space from.
        assert!(!engine.cache(&handle, "echo").unwrap().is_invalid());

        engine
            .transaction("bump", |ctx| ctx.set(&handle, "value", 2i64))
            .unwrap();
        assert_eq!(engine.pending_triggers(), 1);
        assert_eq!(engine.run_pending_triggers(), 0);
        assert!(engine.cache(&handle, "echo").unwrap().is_invalid());
    }

    fn create_slow(engine: &Engine, ty: &Arc<ObjectType>) -> ObjectHandle {
        engine
            .transaction("create", |ctx| ctx.create(ty, [("value", Value::from(1i64))]))
            .unwrap()
    }

    #[test]
    fn never_throttled_triggers_are_not_queued() {
        let ty = ObjectType::builder("Manual")
            .field("value")
            .trigger(
                "echo",
                CacheOptions::trigger().throttling(Throttling::Never),
                |ctx, this, _| ctx.get(this, "value"),
            )
            .build();
        let engine = Engine::new();
        let handle = create_slow(&engine, &ty);
        assert_eq!(engine.pending_triggers(), 0);
        assert!(engine.cache(&handle, "echo").unwrap().is_invalid());

        assert_eq!(engine.call(&handle, "echo", &[]).unwrap(), Value::from(1i64));
        assert!(!engine.cache(&handle, "echo").unwrap().is_invalid());
    }

    #[test]
    fn queue_orders_and_dedups() {
        let ty = ObjectType::builder("Q")
            .trigger("a", CacheOptions::trigger().priority(1), |_, _, _| Ok(Value::Null))
            .trigger("b", CacheOptions::trigger().priority(1), |_, _, _| Ok(Value::Null))
            .trigger("c", CacheOptions::trigger().priority(9), |_, _, _| Ok(Value::Null))
            .build();
        let handle = ObjectHandle::new(crate::types::ObjectId::new(1), ty, None);
        let mut next = 0;
        let mut entry = |name: &str| {
            let op = Arc::clone(handle.object_type().operation(name).unwrap());
            handle.cache_entry(&op, || {
                next += 1;
                crate::types::CacheId::new(next)
            })
        };
        let (a, b, c) = (entry("a"), entry("b"), entry("c"));

        let queue = TriggerQueue::new();
        assert!(queue.push(Arc::clone(&b)));
        assert!(queue.push(Arc::clone(&a)));
        assert!(!queue.push(Arc::clone(&a)));
        assert!(queue.push(Arc::clone(&c)));
        assert_eq!(queue.len(), 3);

        let now = Instant::now();
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_due(now)).map(|e| e.id).collect();
        assert_eq!(order, vec![c.id, a.id, b.id]);
        assert!(queue.next_deadline().is_none());
    }
}
