//! Operation invocation.
//!
//! An invocation resolves the operation's cache entry, serves a memoized
//! result when one is usable, otherwise passes reentrance admission and
//! evaluates the body. Cached and trigger bodies run under a tracking
//! [`Frame`]; their results are stored per snapshot when they saw
//! uncommitted state and published to the entry otherwise.
//!
//! Transaction and trigger operations invoked outside a transaction (from
//! [`Engine::call`] or a view) start a root transaction of their own.

use crate::cache::entry::{dependencies, CacheEntry, Observation};
use crate::cache::options::{CacheOptions, Kind};
use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::object::handle::ObjectHandle;
use crate::object::schema::{Body, BoxFuture};
use crate::reentrance::{admit_async, admit_now};
use crate::snapshot::LocalResult;
use crate::transaction::{AbandonGuard, Context, Frame, TransactionOptions};
use crate::value::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Where an evaluation's result went.
struct Completion {
    /// Stored in the snapshot rather than published.
    local: bool,
    /// Observations as made, before own writes were re-pointed.
    raw: Vec<Observation>,
}

/// Starts a body. Synchronous bodies run to completion here.
fn start_body(body: &Body, ctx: &Context, handle: &ObjectHandle, args: &[Value]) -> BoxFuture<CoreResult<Value>> {
    match body {
        Body::Sync(body) => Box::pin(std::future::ready(body(ctx, handle, args))),
        Body::Async(body) => body(ctx.clone(), handle.clone(), args.to_vec()),
    }
}

fn root_options(entry: &CacheEntry, options: &CacheOptions) -> TransactionOptions {
    TransactionOptions::new(entry.hint()).maybe_journal(options.journal.clone())
}

fn asynchronous(entry: &CacheEntry) -> CoreError {
    CoreError::invalid_operation(format!("{} is asynchronous; use call_async", entry.hint()))
}

impl Context {
    /// Invokes a synchronous operation.
    ///
    /// Cached operations return the memoized result while it is valid for
    /// this transaction. Transaction and trigger operations run nested in
    /// this transaction, or in a root transaction of their own when this
    /// context is read-only.
    pub fn call(&self, handle: &ObjectHandle, op: &str, args: &[Value]) -> CoreResult<Value> {
        let (entry, options) = self.prepare(handle, op)?;
        let body = match &entry.op.body {
            Body::Sync(body) => Arc::clone(body),
            Body::Async(_) => return Err(asynchronous(&entry)),
        };
        let txn = self.transaction();

        match options.kind {
            Kind::Cached => {
                if let Some(result) = self.cached_hit(&entry, &options, args) {
                    return result;
                }
                let invocation = admit_now(&entry, txn)?;
                let _monitor = options.monitor.as_ref().map(|m| m.enter(txn.id()));
                let (inner, frame, started) = self.open_frame(&entry, &options);
                let result = body(&inner, handle, args);
                let completion = self.close_frame(&entry, &options, &frame, args.to_vec(), &result, started);
                drop(invocation);
                self.observe_cache(&entry, &result, completion.local);
                result
            }
            _ if txn.is_read_only() => self.engine().invoke_root(handle, &entry, args.to_vec()),
            kind => {
                self.check_side_effects(&entry)?;
                let _invocation = admit_now(&entry, txn)?;
                let _monitor = options.monitor.as_ref().map(|m| m.enter(txn.id()));
                if kind == Kind::Trigger {
                    let (inner, frame, started) = self.open_frame(&entry, &options);
                    let result = body(&inner, handle, args);
                    self.close_frame(&entry, &options, &frame, args.to_vec(), &result, started);
                    result
                } else {
                    let result = self.without_frame().run(|ctx| body(ctx, handle, args));
                    entry.record_result(args.to_vec(), result.clone());
                    result
                }
            }
        }
    }

    /// Invokes an operation from async code.
    ///
    /// Unlike [`call`](Self::call) this accepts asynchronous bodies, and
    /// reentrance policies that wait for a previous invocation are honored.
    pub fn call_async(&self, handle: &ObjectHandle, op: &str, args: Vec<Value>) -> BoxFuture<CoreResult<Value>> {
        let ctx = self.clone();
        let handle = handle.clone();
        let op = op.to_string();
        Box::pin(async move { ctx.call_owned(handle, op, args).await })
    }

    async fn call_owned(self, handle: ObjectHandle, op: String, args: Vec<Value>) -> CoreResult<Value> {
        let (entry, options) = self.prepare(&handle, &op)?;
        let txn = Arc::clone(self.transaction());

        match options.kind {
            Kind::Cached => {
                if let Some(result) = self.cached_hit(&entry, &options, &args) {
                    return result;
                }
                let (_, invocation) = admit_async(&entry, false, || Arc::clone(&txn)).await?;
                // A waited-for invocation may have left a usable result.
                if let Some(result) = self.cached_hit(&entry, &options, &args) {
                    return result;
                }
                let _worker = txn.enter()?;
                let _monitor = options.monitor.as_ref().map(|m| m.enter(txn.id()));
                let (inner, frame, started) = self.open_frame(&entry, &options);
                let result = start_body(&entry.op.body, &inner, &handle, &args).await;
                let completion = self.close_frame(&entry, &options, &frame, args, &result, started);
                drop(invocation);
                self.observe_cache(&entry, &result, completion.local);
                result
            }
            _ if txn.is_read_only() => self.engine().clone().invoke_root_async(handle, entry, args).await,
            kind => {
                self.check_side_effects(&entry)?;
                let (_, invocation) = admit_async(&entry, false, || Arc::clone(&txn)).await?;
                let _worker = txn.enter()?;
                let _monitor = options.monitor.as_ref().map(|m| m.enter(txn.id()));
                let result = if kind == Kind::Trigger {
                    let (inner, frame, started) = self.open_frame(&entry, &options);
                    let result = start_body(&entry.op.body, &inner, &handle, &args).await;
                    self.close_frame(&entry, &options, &frame, args, &result, started);
                    result
                } else {
                    let result = start_body(&entry.op.body, &self.without_frame(), &handle, &args).await;
                    if let Err(err) = &result {
                        txn.cancel(err.clone(), None);
                    }
                    entry.record_result(args, result.clone());
                    result
                };
                drop(invocation);
                result
            }
        }
    }

    fn prepare(&self, handle: &ObjectHandle, op: &str) -> CoreResult<(Arc<CacheEntry>, CacheOptions)> {
        let ty = handle.object_type();
        let op = ty
            .operation(op)
            .ok_or_else(|| CoreError::unknown_operation(ty.name(), op))?;
        let txn = self.transaction();
        if txn.snapshot.lock().is_unmounted(handle) {
            return Err(CoreError::unmounted(handle.hint()));
        }
        txn.check_running()?;
        let entry = self.engine().entry(handle, op);
        let options = entry.options();
        Ok((entry, options))
    }

    fn check_side_effects(&self, entry: &CacheEntry) -> CoreResult<()> {
        match self.frame() {
            Some(frame) if frame.no_side_effects() => Err(CoreError::invalid_operation(format!(
                "{} has no side effects and cannot call {}",
                frame.entry.hint(),
                entry.hint()
            ))),
            _ => Ok(()),
        }
    }

    /// Serves a memoized result: first one computed in this snapshot, then
    /// a published one this snapshot may see and has not invalidated by
    /// its own writes.
    fn cached_hit(&self, entry: &Arc<CacheEntry>, options: &CacheOptions, args: &[Value]) -> Option<CoreResult<Value>> {
        let txn = self.transaction();
        let (result, local) = {
            let snapshot = txn.snapshot.lock();
            match snapshot.local_hit(entry, args, options.sensitive_args) {
                Some(local) => (local.result.clone(), true),
                None => {
                    let (result, deps) = entry.hit(args, options.sensitive_args, snapshot.start)?;
                    if snapshot.writes_any(&deps) {
                        return None;
                    }
                    (result, false)
                }
            }
        };
        txn.stats().record_cache_hit();
        self.observe_cache(entry, &result, local);
        Some(result)
    }

    fn open_frame(&self, entry: &Arc<CacheEntry>, options: &CacheOptions) -> (Context, Arc<Frame>, Instant) {
        let frame = Frame::new(Arc::clone(entry), options.no_side_effects);
        (self.with_frame(Arc::clone(&frame)), frame, Instant::now())
    }

    fn close_frame(
        &self,
        entry: &Arc<CacheEntry>,
        options: &CacheOptions,
        frame: &Frame,
        args: Vec<Value>,
        result: &CoreResult<Value>,
        started: Instant,
    ) -> Completion {
        let txn = self.transaction();
        if options.kind == Kind::Cached {
            txn.stats().record_cache_evaluation();
            let elapsed = started.elapsed();
            let threshold = self.engine().config().slow_evaluation_threshold;
            if elapsed >= threshold {
                warn!(
                    cache = %entry.hint(),
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "slow cache evaluation"
                );
            }
        } else if let Err(err) = result {
            txn.cancel(err.clone(), None);
        }
        self.complete(entry, options.kind, frame, args, result)
    }

    /// Stores an evaluation result by kind.
    fn complete(
        &self,
        entry: &Arc<CacheEntry>,
        kind: Kind,
        frame: &Frame,
        args: Vec<Value>,
        result: &CoreResult<Value>,
    ) -> Completion {
        let txn = self.transaction();
        let mut snapshot = txn.snapshot.lock();
        let (raw, observations, local) = frame.finish(&mut snapshot);
        let local = !txn.is_read_only() && (local || kind == Kind::Trigger);

        if local {
            if result.is_ok() {
                snapshot.remember(LocalResult {
                    entry: Arc::clone(entry),
                    args,
                    result: result.clone(),
                    deps: dependencies(&observations),
                    observations,
                });
            }
            return Completion { local, raw };
        }

        let start = snapshot.start;
        drop(snapshot);
        match result {
            Ok(_) => {
                entry.publish(args, result.clone(), &observations, start, self.engine().applied(), false);
            }
            Err(err) => entry.record_failure(args, err.clone(), start),
        }
        Completion { local, raw }
    }
}

impl Engine {
    /// Runs a synchronous transaction or trigger operation in a root
    /// transaction.
    pub(crate) fn invoke_root(&self, handle: &ObjectHandle, entry: &Arc<CacheEntry>, args: Vec<Value>) -> CoreResult<Value> {
        let options = entry.options();
        let body = match &entry.op.body {
            Body::Sync(body) => Arc::clone(body),
            Body::Async(_) => return Err(asynchronous(entry)),
        };
        let txn = self.begin(root_options(entry, &options));
        let invocation = match admit_now(entry, &txn) {
            Ok(invocation) => invocation,
            Err(err) => {
                txn.abandon();
                return Err(err);
            }
        };
        let monitor = options.monitor.as_ref().map(|m| m.enter(txn.id()));

        let (result, raw) = match txn.enter() {
            Ok(_worker) => {
                let ctx = txn.context();
                if options.kind == Kind::Trigger {
                    let (inner, frame, started) = ctx.open_frame(entry, &options);
                    let result = body(&inner, handle, &args);
                    let completion = ctx.close_frame(entry, &options, &frame, args.clone(), &result, started);
                    (result, completion.raw)
                } else {
                    (ctx.run(|ctx| body(ctx, handle, &args)), Vec::new())
                }
            }
            Err(err) => (Err(err), Vec::new()),
        };
        drop(monitor);
        txn.seal();
        let result = txn.settle(result);
        drop(invocation);
        self.settle_root(entry, options.kind, args, &result, &raw);
        result
    }

    /// Runs a transaction or trigger operation in a root transaction from
    /// async code, waiting and replaying as the reentrance policy requires.
    pub(crate) async fn invoke_root_async(
        self,
        handle: ObjectHandle,
        entry: Arc<CacheEntry>,
        args: Vec<Value>,
    ) -> CoreResult<Value> {
        let options = entry.options();
        loop {
            let (txn, invocation) =
                admit_async(&entry, true, || self.begin(root_options(&entry, &options))).await?;
            let mut abandon = AbandonGuard::new(&txn);
            let monitor = options.monitor.as_ref().map(|m| m.enter(txn.id()));
            let worker = txn.enter()?;

            let ctx = txn.context();
            let (result, raw) = if options.kind == Kind::Trigger {
                let (inner, frame, started) = ctx.open_frame(&entry, &options);
                let result = start_body(&entry.op.body, &inner, &handle, &args).await;
                let completion = ctx.close_frame(&entry, &options, &frame, args.clone(), &result, started);
                (result, completion.raw)
            } else {
                let result = start_body(&entry.op.body, &ctx, &handle, &args).await;
                if let Err(err) = &result {
                    txn.cancel(err.clone(), None);
                }
                (result, Vec::new())
            };
            drop(worker);
            drop(monitor);
            txn.seal();
            abandon.disarm();

            let outcome = txn.when_finished().await;
            drop(invocation);
            if outcome.is_err() {
                if let Some(after) = txn.restart_after() {
                    debug!(operation = %entry.hint(), after = %after, "replaying canceled invocation");
                    // The successor's own outcome does not matter here.
                    let _ = after.when_finished().await;
                    continue;
                }
            }
            let result = txn.settle(result);
            self.settle_root(&entry, options.kind, args, &result, &raw);
            return result;
        }
    }

    /// Records the result of a root invocation. A trigger's successful
    /// result was published when its transaction applied; a failed run is
    /// re-queued on conflict and otherwise kept as its result until one of
    /// its dependencies changes.
    fn settle_root(
        &self,
        entry: &Arc<CacheEntry>,
        kind: Kind,
        args: Vec<Value>,
        result: &CoreResult<Value>,
        raw: &[Observation],
    ) {
        if kind != Kind::Trigger {
            entry.record_result(args, result.clone());
            return;
        }
        match result {
            Ok(_) => {}
            Err(err) if err.is_canceled() => {}
            Err(err) if err.is_conflict() => {
                debug!(trigger = %entry.hint(), error = %err, "trigger conflicted; re-queued");
                self.schedule(vec![Arc::clone(entry)]);
            }
            Err(err) => {
                error!(trigger = %entry.hint(), error = %err, "trigger failed");
                let applied = self.applied();
                if !entry.publish(args, Err(err.clone()), raw, applied, applied, true) {
                    self.schedule(vec![Arc::clone(entry)]);
                }
            }
        }
    }
}
