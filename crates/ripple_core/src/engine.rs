//! Engine facade, commit protocol and record garbage collection.

use crate::cache::entry::CacheEntry;
use crate::cache::options::Kind;
use crate::cache::trigger::TriggerQueue;
use crate::cache::{invalidate_all, CacheHandle};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::journal::{CommitEvent, Journal};
use crate::object::handle::ObjectHandle;
use crate::object::record::Record;
use crate::object::schema::{BoxFuture, Operation};
use crate::snapshot::{Snapshot, SnapshotStatus};
use crate::stats::EngineStats;
use crate::transaction::{AbandonGuard, Context, Transaction, TransactionOptions};
use crate::types::{CacheId, ObjectId, SnapshotId, Stamp};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The reactive engine.
///
/// `Engine` is the entry point for working with reactive objects. It
/// provides:
/// - Transactions (sync, async and manual) over snapshot-isolated state
/// - Read-only views of the latest committed state
/// - Operation invocation with memoization and reentrance control
/// - Trigger scheduling
/// - A commit journal and statistics
///
/// Cloning an engine clones the reference.
///
/// ```rust,ignore
/// use ripple_core::{CacheOptions, Engine, ObjectType, Value};
///
/// let demo = ObjectType::builder("Demo")
///     .field("title")
///     .cached("render", CacheOptions::cached(), |ctx, this, _| {
///         Ok(Value::from(format!("<h1>{}</h1>", ctx.get(this, "title")?)))
///     })
///     .build();
///
/// let engine = Engine::new();
/// let obj = engine.transaction("create", |ctx| {
///     ctx.create(&demo, [("title", Value::from("Demo"))])
/// })?;
///
/// assert_eq!(engine.call(&obj, "render", &[])?, Value::from("<h1>Demo</h1>"));
/// engine.transaction("rename", |ctx| ctx.set(&obj, "title", "Updated"))?;
/// assert!(engine.cache(&obj, "render")?.is_invalid());
/// ```
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: Config,
    next_snapshot: AtomicU64,
    next_object: AtomicU64,
    next_cache: AtomicU64,
    /// Stamp of the last applied snapshot.
    applied: AtomicU64,
    /// Serializes rebase and apply.
    commit_lock: Mutex<()>,
    /// Start stamps of live snapshots, with counts.
    active: Mutex<BTreeMap<Stamp, usize>>,
    /// Applied records whose predecessors may still be visible, in stamp order.
    gc: Mutex<VecDeque<Arc<Record>>>,
    objects: RwLock<HashMap<ObjectId, ObjectHandle>>,
    pub(crate) triggers: TriggerQueue,
    journal: Arc<Journal>,
    stats: EngineStats,
}

/// Registration of a snapshot as an active reader. Records it may still
/// need are kept until the lease is dropped.
pub(crate) struct SnapshotLease {
    inner: Arc<EngineInner>,
    start: Stamp,
}

impl SnapshotLease {
    pub(crate) fn start(&self) -> Stamp {
        self.start
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        self.inner.release(self.start);
    }
}

/// What an applied transaction leaves for the engine to do after its
/// locks are released.
pub(crate) struct Commit {
    pub(crate) stamp: Stamp,
    pub(crate) event: Option<CommitEvent>,
    pub(crate) triggers: Vec<Arc<CacheEntry>>,
    pub(crate) created: Vec<ObjectHandle>,
}

impl EngineInner {
    pub(crate) fn acquire_snapshot(self: &Arc<Self>) -> Snapshot {
        let id = SnapshotId::new(self.next_snapshot.fetch_add(1, Ordering::Relaxed) + 1);
        let start = {
            let mut active = self.active.lock();
            let start = Stamp::new(self.applied.load(Ordering::Acquire));
            *active.entry(start).or_insert(0) += 1;
            start
        };
        Snapshot::new(
            id,
            SnapshotLease {
                inner: Arc::clone(self),
                start,
            },
        )
    }

    fn release(&self, start: Stamp) {
        {
            let mut active = self.active.lock();
            if let Some(count) = active.get_mut(&start) {
                *count -= 1;
                if *count == 0 {
                    active.remove(&start);
                }
            }
        }
        self.collect_garbage();
    }

    /// Unlinks predecessors no live or future snapshot can reach.
    fn collect_garbage(&self) {
        let floor = {
            let active = self.active.lock();
            active
                .keys()
                .next()
                .copied()
                .unwrap_or_else(|| Stamp::new(self.applied.load(Ordering::Acquire)))
        };
        let mut gc = self.gc.lock();
        while gc.front().is_some_and(|record| record.stamp <= floor) {
            if let Some(record) = gc.pop_front() {
                record.unlink_prev();
            }
        }
    }

    fn applied(&self) -> Stamp {
        Stamp::new(self.applied.load(Ordering::Acquire))
    }

    /// Rebases and applies a sealed transaction's snapshot.
    ///
    /// Under the commit lock: conflicts are checked, records published,
    /// superseded values invalidate their observers, results computed in
    /// the snapshot are published, and the commit event is journaled.
    pub(crate) fn commit(&self, txn: &Transaction, side_by_side: bool) -> CoreResult<Commit> {
        let mut snapshot = txn.snapshot.lock();
        snapshot.status = SnapshotStatus::Sealed;
        if txn.is_read_only() {
            snapshot.status = SnapshotStatus::Applied;
            return Ok(Commit {
                stamp: self.applied(),
                event: None,
                triggers: Vec::new(),
                created: Vec::new(),
            });
        }

        let _commit = self.commit_lock.lock();
        let conflicts = snapshot.rebase();
        if !conflicts.is_empty() {
            self.stats.record_conflict();
            if !side_by_side {
                snapshot.discard();
                return Err(CoreError::conflict(txn.to_string(), conflicts));
            }
            warn!(snapshot = %txn.id(), hint = txn.hint(), fields = ?conflicts, "conflict ignored for side-by-side transaction");
        }

        let previous = self.applied();
        let applied = snapshot.apply(previous.next());
        let stamp = if applied.records.is_empty() {
            previous
        } else {
            previous.next()
        };

        // Observers are invalid before a snapshot can start at `stamp`.
        let mut invalidated = invalidate_all(applied.invalidated);
        if stamp != previous {
            self.applied.store(stamp.as_u64(), Ordering::Release);
        }
        let mut triggers = Vec::new();
        for local in snapshot.take_local_results() {
            let valid = local
                .entry
                .publish(local.args, local.result, &local.observations, stamp, stamp, true);
            if !valid && local.entry.options().kind == Kind::Trigger {
                triggers.push(local.entry);
            }
        }

        let mut created = Vec::new();
        {
            let mut objects = self.objects.write();
            for handle in snapshot.take_created() {
                if !handle.is_unmounted() {
                    objects.insert(handle.id(), handle.clone());
                    created.push(handle);
                }
            }
            for handle in &applied.unmounted {
                objects.remove(&handle.id());
                for entry in handle.take_caches() {
                    invalidated.extend(invalidate_all(entry.retire()));
                }
            }
        }

        let event = (!applied.changes.is_empty()).then(|| CommitEvent {
            stamp,
            snapshot: txn.id(),
            hint: txn.hint().to_string(),
            changes: applied.changes,
        });
        if let Some(event) = &event {
            self.journal.emit(event.clone());
        }
        self.gc.lock().extend(applied.records);
        drop(_commit);
        drop(snapshot);

        self.stats.record_invalidations(invalidated.len() as u64);
        triggers.extend(
            invalidated
                .into_iter()
                .filter(|e| e.options().kind == Kind::Trigger && !e.is_retired()),
        );
        self.collect_garbage();
        Ok(Commit {
            stamp,
            event,
            triggers,
            created,
        })
    }
}

impl Engine {
    /// Creates an engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an engine with custom configuration.
    pub fn with_config(config: Config) -> Self {
        let journal = Arc::new(Journal::with_max_history(config.journal_history));
        Self {
            inner: Arc::new(EngineInner {
                config,
                next_snapshot: AtomicU64::new(0),
                next_object: AtomicU64::new(0),
                next_cache: AtomicU64::new(0),
                applied: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
                active: Mutex::new(BTreeMap::new()),
                gc: Mutex::new(VecDeque::new()),
                objects: RwLock::new(HashMap::new()),
                triggers: TriggerQueue::new(),
                journal,
                stats: EngineStats::new(),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the engine statistics.
    pub fn stats(&self) -> &EngineStats {
        &self.inner.stats
    }

    /// Returns the engine journal, which receives every applied commit.
    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    /// Returns the stamp of the last applied snapshot.
    pub fn applied(&self) -> Stamp {
        self.inner.applied()
    }

    pub(crate) fn next_object_id(&self) -> ObjectId {
        ObjectId::new(self.inner.next_object.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Returns the cache entry of `op` on `handle`.
    pub(crate) fn entry(&self, handle: &ObjectHandle, op: &Arc<Operation>) -> Arc<CacheEntry> {
        handle.cache_entry(op, || {
            CacheId::new(self.inner.next_cache.fetch_add(1, Ordering::Relaxed) + 1)
        })
    }

    /// Looks up a mounted object created by an applied transaction.
    pub fn object(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.inner.objects.read().get(&id).cloned()
    }

    /// Returns the number of mounted objects.
    pub fn object_count(&self) -> usize {
        self.inner.objects.read().len()
    }

    /// Starts a manual transaction.
    ///
    /// Work is bracketed by [`Transaction::enter`]; the transaction applies
    /// once sealed with no worker left.
    pub fn begin(&self, options: TransactionOptions) -> Arc<Transaction> {
        let snapshot = self.inner.acquire_snapshot();
        self.inner.stats.record_transaction_start();
        debug!(snapshot = %snapshot.id, hint = %options.hint, start = %snapshot.start, "transaction started");
        Transaction::new(self.clone(), snapshot, options, false)
    }

    /// Returns a read-only context over the latest committed state.
    ///
    /// The view keeps the records it can see alive; drop it when done.
    pub fn view(&self) -> Context {
        let snapshot = self.inner.acquire_snapshot();
        Transaction::new(self.clone(), snapshot, TransactionOptions::new("view"), true).context()
    }

    /// Runs `f` in a new transaction and applies it.
    ///
    /// An error returned by `f` discards the transaction and is returned;
    /// a conflict found at apply time is returned as [`CoreError::Conflict`].
    ///
    /// ```rust,ignore
    /// engine.transaction("rename", |ctx| ctx.set(&obj, "title", "Updated"))?;
    /// ```
    pub fn transaction<T>(&self, hint: &str, f: impl FnOnce(&Context) -> CoreResult<T>) -> CoreResult<T> {
        self.transaction_with(TransactionOptions::new(hint), f)
    }

    /// Runs `f` in a new transaction with custom options.
    pub fn transaction_with<T>(
        &self,
        options: TransactionOptions,
        f: impl FnOnce(&Context) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let txn = self.begin(options);
        let result = match txn.enter() {
            Ok(_worker) => {
                let result = f(&txn.context());
                if let Err(err) = &result {
                    txn.cancel(err.clone(), None);
                }
                result
            }
            Err(err) => Err(err),
        };
        txn.seal();
        txn.settle(result)
    }

    /// Runs an async body in a new transaction and applies it.
    ///
    /// If the transaction is canceled with a successor, the body is run
    /// again in a fresh transaction once the successor has finished.
    /// Dropping the returned future before the body completes discards the
    /// transaction.
    pub async fn transaction_async<T, F, Fut>(&self, options: TransactionOptions, f: F) -> CoreResult<T>
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        loop {
            let txn = self.begin(options.clone());
            let mut abandon = AbandonGuard::new(&txn);
            let worker = txn.enter()?;
            let result = f(txn.context()).await;
            if let Err(err) = &result {
                txn.cancel(err.clone(), None);
            }
            drop(worker);
            txn.seal();
            abandon.disarm();

            if txn.when_finished().await.is_err() {
                if let Some(after) = txn.restart_after() {
                    debug!(snapshot = %txn.id(), after = %after, "replaying canceled transaction");
                    // The successor's own outcome does not matter here.
                    let _ = after.when_finished().await;
                    continue;
                }
            }
            return txn.settle(result);
        }
    }

    /// Reads a field from the latest committed state.
    pub fn get(&self, handle: &ObjectHandle, field: &str) -> CoreResult<Value> {
        self.view().get(handle, field)
    }

    /// Invokes a synchronous operation outside any transaction.
    ///
    /// Cached operations are served from their cache; transaction and
    /// trigger operations run in a root transaction of their own.
    pub fn call(&self, handle: &ObjectHandle, op: &str, args: &[Value]) -> CoreResult<Value> {
        self.view().call(handle, op, args)
    }

    /// Invokes an operation outside any transaction from async code.
    pub fn call_async(&self, handle: &ObjectHandle, op: &str, args: Vec<Value>) -> BoxFuture<CoreResult<Value>> {
        self.view().call_async(handle, op, args)
    }

    /// Returns the cache handle of `op` on `handle`.
    pub fn cache(&self, handle: &ObjectHandle, op: &str) -> CoreResult<CacheHandle> {
        let ty = handle.object_type();
        let op = ty
            .operation(op)
            .ok_or_else(|| CoreError::unknown_operation(ty.name(), op))?;
        Ok(CacheHandle::new(self.entry(handle, op), self.clone()))
    }

    /// Schedules and drains the triggers left by an applied transaction.
    pub(crate) fn after_commit(&self, commit: Commit) {
        let mut entries = commit.triggers;
        if self.inner.config.auto_start_triggers {
            for handle in &commit.created {
                for op in handle.object_type().triggers() {
                    entries.push(self.entry(handle, op));
                }
            }
        }
        self.schedule(entries);
        self.run_pending_triggers();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("applied", &self.applied())
            .field("objects", &self.object_count())
            .field("pending_triggers", &self.pending_triggers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::schema::ObjectType;

    fn demo() -> Arc<ObjectType> {
        ObjectType::builder("Demo").field("title").field("users").build()
    }

    fn create(engine: &Engine) -> ObjectHandle {
        engine
            .transaction("create", |ctx| {
                ctx.create(&demo(), [("title", Value::from("Demo")), ("users", Value::from(0i64))])
            })
            .unwrap()
    }

    #[test]
    fn created_objects_are_registered() {
        let engine = Engine::new();
        let handle = create(&engine);
        assert_eq!(engine.object(handle.id()), Some(handle.clone()));
        assert_eq!(engine.object_count(), 1);
        assert_eq!(engine.applied(), Stamp::new(1));
    }

    #[test]
    fn discarded_creation_leaves_nothing() {
        let engine = Engine::new();
        let err = engine
            .transaction("create", |ctx| {
                ctx.create(&demo(), [("title", Value::from("x"))])?;
                Err::<(), _>(CoreError::failed("stop"))
            })
            .unwrap_err();
        assert_eq!(err, CoreError::failed("stop"));
        assert_eq!(engine.object_count(), 0);
        assert_eq!(engine.applied(), Stamp::ZERO);
    }

    #[test]
    fn conflicting_transactions_fail_the_later_one() {
        let engine = Engine::new();
        let handle = create(&engine);

        let a = engine.begin(TransactionOptions::new("a"));
        let b = engine.begin(TransactionOptions::new("b"));
        {
            let _w = a.enter().unwrap();
            a.context().set(&handle, "title", "A").unwrap();
        }
        {
            let _w = b.enter().unwrap();
            b.context().set(&handle, "title", "B").unwrap();
        }
        a.seal();
        b.seal();

        assert_eq!(a.outcome(), Some(Ok(())));
        let err = b.outcome().unwrap().unwrap_err();
        assert_eq!(err, CoreError::conflict(b.to_string(), vec!["Demo.title".to_string()]));
        assert_eq!(engine.get(&handle, "title").unwrap(), Value::from("A"));
        assert_eq!(engine.stats().conflicts(), 1);
    }

    #[test]
    fn disjoint_fields_merge() {
        let engine = Engine::new();
        let handle = create(&engine);

        let a = engine.begin(TransactionOptions::new("a"));
        let b = engine.begin(TransactionOptions::new("b"));
        {
            let _w = a.enter().unwrap();
            a.context().set(&handle, "title", "A").unwrap();
        }
        {
            let _w = b.enter().unwrap();
            b.context().set(&handle, "users", 3i64).unwrap();
        }
        a.seal();
        b.seal();

        assert_eq!(b.outcome(), Some(Ok(())));
        assert_eq!(engine.get(&handle, "title").unwrap(), Value::from("A"));
        assert_eq!(engine.get(&handle, "users").unwrap(), Value::from(3i64));
    }

    #[test]
    fn side_by_side_transaction_overwrites() {
        let engine = Engine::new();
        let handle = create(&engine);

        let a = engine.begin(TransactionOptions::new("a"));
        let b = engine.begin(TransactionOptions::new("b").side_by_side(true));
        {
            let _w = b.enter().unwrap();
            b.context().set(&handle, "title", "B").unwrap();
        }
        {
            let _w = a.enter().unwrap();
            a.context().set(&handle, "title", "A").unwrap();
        }
        a.seal();
        b.seal();

        assert_eq!(b.outcome(), Some(Ok(())));
        assert_eq!(engine.get(&handle, "title").unwrap(), Value::from("B"));
    }

    #[test]
    fn snapshot_isolation_for_open_views() {
        let engine = Engine::new();
        let handle = create(&engine);
        let before = engine.view();
        engine
            .transaction("rename", |ctx| ctx.set(&handle, "title", "Updated"))
            .unwrap();

        assert_eq!(before.get(&handle, "title").unwrap(), Value::from("Demo"));
        assert_eq!(engine.get(&handle, "title").unwrap(), Value::from("Updated"));
    }

    #[test]
    fn superseded_records_are_collected() {
        let engine = Engine::new();
        let handle = create(&engine);
        let view = engine.view();
        engine
            .transaction("rename", |ctx| ctx.set(&handle, "title", "Updated"))
            .unwrap();
        assert!(handle.head().prev().is_some());

        drop(view);
        engine
            .transaction("again", |ctx| ctx.set(&handle, "users", 1i64))
            .unwrap();
        assert!(handle.head().prev().is_none());
    }

    #[test]
    fn commits_are_journaled() {
        let engine = Engine::new();
        let feed = engine.journal().subscribe();
        let handle = create(&engine);
        engine
            .transaction("rename", |ctx| ctx.set(&handle, "title", "Updated"))
            .unwrap();

        let created = feed.recv().unwrap();
        assert_eq!(created.hint, "create");
        assert_eq!(created.changes.len(), 2);

        let renamed = feed.recv().unwrap();
        let change = renamed.change(handle.id(), "title").unwrap();
        assert_eq!(change.old, Some(Value::from("Demo")));
        assert_eq!(change.new, Value::from("Updated"));
        assert_eq!(engine.journal().latest_stamp(), renamed.stamp);
    }

    #[test]
    fn transaction_journal_binding() {
        let engine = Engine::new();
        let handle = create(&engine);
        let journal = Arc::new(Journal::new());
        engine
            .transaction_with(TransactionOptions::new("bound").journal(Arc::clone(&journal)), |ctx| {
                ctx.set(&handle, "users", 9i64)
            })
            .unwrap();
        assert_eq!(journal.history_len(), 1);
        assert_eq!(engine.journal().history_len(), 2);
    }

    #[tokio::test]
    async fn async_transaction_applies() {
        let engine = Engine::new();
        let handle = create(&engine);
        let target = handle.clone();
        let users = engine
            .transaction_async(TransactionOptions::new("async"), move |ctx| {
                let target = target.clone();
                async move {
                    tokio::task::yield_now().await;
                    ctx.set(&target, "users", 5i64)?;
                    ctx.get(&target, "users")
                }
            })
            .await
            .unwrap();
        assert_eq!(users, Value::from(5i64));
        assert_eq!(engine.get(&handle, "users").unwrap(), Value::from(5i64));
    }

    #[tokio::test]
    async fn canceled_with_successor_replays() {
        let engine = Engine::new();
        let handle = create(&engine);
        let attempts = Arc::new(AtomicU64::new(0));

        let blocker = engine.begin(TransactionOptions::new("blocker"));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<Arc<Transaction>>();
        let started_tx = Arc::new(Mutex::new(Some(started_tx)));

        let task = {
            let engine = engine.clone();
            let handle = handle.clone();
            let attempts = Arc::clone(&attempts);
            tokio::spawn(async move {
                engine
                    .transaction_async(TransactionOptions::new("replayed"), move |ctx| {
                        let handle = handle.clone();
                        let attempts = Arc::clone(&attempts);
                        let started_tx = Arc::clone(&started_tx);
                        async move {
                            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                            if let Some(tx) = started_tx.lock().take() {
                                let _ = tx.send(Arc::clone(ctx.transaction()));
                            }
                            tokio::task::yield_now().await;
                            ctx.set(&handle, "users", n as i64)
                        }
                    })
                    .await
            })
        };

        let first = started_rx.await.unwrap();
        first.cancel(CoreError::canceled("superseded"), Some(Arc::clone(&blocker)));
        blocker.seal();
        task.await.unwrap().unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(engine.get(&handle, "users").unwrap(), Value::from(2i64));
    }
}
