//! Transactions over snapshots.
//!
//! A transaction owns one [`Snapshot`](crate::snapshot) and moves through:
//! - **Running**: workers read and write through a [`Context`]; nested runs
//!   share the snapshot
//! - **Sealed**: no new top-level work is accepted; the transaction
//!   finishes as soon as its last worker exits
//! - **Applied** / **Discarded**: the snapshot was rebased and published,
//!   or thrown away because of an error, a cancel or a conflict
//!
//! Canceling records an error and an optional successor. A canceled async
//! invocation whose successor is set waits for it and then replays.

mod context;
mod state;

pub use context::Context;
pub(crate) use context::Frame;
pub use state::{TransactionOptions, TransactionStatus};

use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::snapshot::Snapshot;
use crate::stats::EngineStats;
use crate::types::{FieldKey, ObjectId, SnapshotId};
use parking_lot::Mutex;
use state::TxState;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A unit of work over one snapshot.
pub struct Transaction {
    engine: Engine,
    id: SnapshotId,
    hint: String,
    journal: Option<Arc<Journal>>,
    read_only: bool,
    pub(crate) snapshot: Mutex<Snapshot>,
    state: Mutex<TxState>,
    done: watch::Sender<bool>,
}

impl Transaction {
    pub(crate) fn new(
        engine: Engine,
        snapshot: Snapshot,
        options: TransactionOptions,
        read_only: bool,
    ) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            engine,
            id: snapshot.id,
            hint: options.hint,
            journal: options.journal,
            read_only,
            snapshot: Mutex::new(snapshot),
            state: Mutex::new(TxState::new(options.side_by_side)),
            done,
        })
    }

    /// Returns the snapshot ID.
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Returns the diagnostic hint.
    pub fn hint(&self) -> &str {
        &self.hint
    }

    /// Returns true for the read-only transaction behind [`Engine::view`].
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns a context for work in this transaction.
    pub fn context(self: &Arc<Self>) -> Context {
        Context::new(Arc::clone(self))
    }

    /// Returns the current status.
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// Returns true once the transaction carries an error.
    pub fn is_canceled(&self) -> bool {
        self.state.lock().error.is_some()
    }

    /// Returns the error the transaction was canceled with.
    pub fn error(&self) -> Option<CoreError> {
        self.state.lock().error.clone()
    }

    /// Returns true once applied or discarded.
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns the outcome of a finished transaction.
    pub fn outcome(&self) -> Option<CoreResult<()>> {
        self.state.lock().outcome.clone()
    }

    /// Returns every field read so far, sorted.
    pub fn read_set(&self) -> Vec<(ObjectId, FieldKey)> {
        self.snapshot.lock().read_set()
    }

    /// Returns the successor a canceled invocation waits for before replaying.
    pub fn restart_after(&self) -> Option<Arc<Transaction>> {
        self.state.lock().restart_after.clone()
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn stats(&self) -> &EngineStats {
        self.engine.stats()
    }

    pub(crate) fn set_side_by_side(&self) {
        self.state.lock().side_by_side = true;
    }

    fn sealed_error(&self) -> CoreError {
        CoreError::sealed(self.id, self.hint.clone())
    }

    /// Fails if the transaction was canceled or has finished.
    pub(crate) fn check_running(&self) -> CoreResult<()> {
        let state = self.state.lock();
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        if state.status != TransactionStatus::Running {
            return Err(self.sealed_error());
        }
        Ok(())
    }

    /// Starts a worker segment.
    ///
    /// Fails once the transaction is canceled, finished, or sealed with no
    /// worker left to keep it open.
    pub fn enter(self: &Arc<Self>) -> CoreResult<WorkerGuard> {
        let mut state = self.state.lock();
        if state.status != TransactionStatus::Running {
            return Err(self.sealed_error());
        }
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        if state.sealed && state.workers == 0 {
            return Err(self.sealed_error());
        }
        state.workers += 1;
        Ok(WorkerGuard {
            txn: Arc::clone(self),
        })
    }

    fn exit(&self) {
        let ready = {
            let mut state = self.state.lock();
            state.workers = state.workers.saturating_sub(1);
            state.ready_to_finish()
        };
        if ready {
            self.finish();
        }
    }

    /// Stops accepting new top-level work. The transaction finishes when
    /// its last worker exits.
    pub fn seal(&self) {
        let ready = {
            let mut state = self.state.lock();
            state.sealed = true;
            state.ready_to_finish()
        };
        if ready {
            self.finish();
        }
    }

    /// Cancels the transaction: it is sealed and will be discarded.
    ///
    /// `restart_after` names the transaction a canceled async invocation
    /// waits for before replaying; `None` means no restart. Returns false if
    /// the transaction was already canceled or finished.
    pub fn cancel(&self, error: CoreError, restart_after: Option<Arc<Transaction>>) -> bool {
        let ready = {
            let mut state = self.state.lock();
            if state.status != TransactionStatus::Running || state.error.is_some() {
                return false;
            }
            state.error = Some(error);
            state.restart_after = restart_after;
            state.sealed = true;
            state.ready_to_finish()
        };
        self.stats().record_cancellation();
        debug!(snapshot = %self.id, hint = %self.hint, "transaction canceled");
        if ready {
            self.finish();
        }
        true
    }

    /// Discards an attempt that never did any work.
    pub(crate) fn abandon(&self) {
        let ready = {
            let mut state = self.state.lock();
            if state.status != TransactionStatus::Running {
                return;
            }
            if state.error.is_none() {
                state.error = Some(CoreError::canceled(format!("{self} was abandoned")));
            }
            state.sealed = true;
            state.ready_to_finish()
        };
        if ready {
            self.finish();
        }
    }

    fn finish(&self) {
        let (error, side_by_side) = {
            let mut state = self.state.lock();
            if !state.ready_to_finish() {
                return;
            }
            state.status = TransactionStatus::Sealing;
            (state.error.clone(), state.side_by_side)
        };

        let result = match error {
            Some(err) => {
                self.snapshot.lock().discard();
                Err(err)
            }
            None => self.engine.inner.commit(self, side_by_side),
        };
        self.snapshot.lock().release();

        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        {
            let mut state = self.state.lock();
            state.status = if outcome.is_ok() {
                TransactionStatus::Applied
            } else {
                TransactionStatus::Discarded
            };
            state.outcome = Some(outcome);
        }

        match &result {
            Ok(commit) => {
                if let (Some(journal), Some(event)) = (&self.journal, &commit.event) {
                    journal.emit(event.clone());
                }
                if !self.read_only {
                    self.stats().record_transaction_apply();
                }
                debug!(snapshot = %self.id, hint = %self.hint, stamp = %commit.stamp, "transaction applied");
            }
            Err(err) => {
                self.stats().record_transaction_discard();
                debug!(snapshot = %self.id, hint = %self.hint, error = %err, "transaction discarded");
            }
        }
        self.done.send_replace(true);

        if let Ok(commit) = result {
            self.engine.after_commit(commit);
        }
    }

    /// Waits until the transaction is applied or discarded.
    pub async fn when_finished(&self) -> CoreResult<()> {
        let mut done = self.done.subscribe();
        // The sender lives as long as `self`.
        let _ = done.wait_for(|done| *done).await;
        self.outcome()
            .unwrap_or_else(|| Err(CoreError::invalid_operation(format!("{self} did not finish"))))
    }

    /// Combines a body's result with the transaction outcome: a discarded
    /// transaction reports its error even if the body succeeded.
    pub(crate) fn settle<T>(&self, result: CoreResult<T>) -> CoreResult<T> {
        match self.outcome() {
            Some(Err(err)) => Err(err),
            _ => result,
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.hint)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("hint", &self.hint)
            .field("status", &self.status())
            .finish()
    }
}

/// One worker segment of a transaction. Dropping it exits the segment.
#[must_use = "the worker segment ends when the guard is dropped"]
pub struct WorkerGuard {
    txn: Arc<Transaction>,
}

impl WorkerGuard {
    /// Returns the transaction.
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.txn.exit();
    }
}

/// Abandons a transaction when an async invocation is dropped before it
/// sealed its work.
pub(crate) struct AbandonGuard {
    txn: Option<Arc<Transaction>>,
}

impl AbandonGuard {
    pub(crate) fn new(txn: &Arc<Transaction>) -> Self {
        Self {
            txn: Some(Arc::clone(txn)),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.txn = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            txn.abandon();
        }
    }
}
