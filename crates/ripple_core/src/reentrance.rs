//! Reentrance control for overlapping invocations of one operation.
//!
//! Every invocation of an operation on an object registers an in-flight
//! token on the operation's cache entry. A second invocation that arrives
//! while a token is registered is admitted, rejected, or made to wait
//! according to the operation's [`Reentrance`] policy. Cancels and waits
//! are carried out by the caller after the entry lock is released.

use crate::cache::entry::CacheEntry;
use crate::cache::options::Kind;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use std::sync::Arc;
use tokio::sync::watch;

/// Policy for an invocation that overlaps a previous one still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reentrance {
    /// Fail immediately with a reentrance error.
    #[default]
    PreventWithError,
    /// Wait for the previous invocation to finish, then start.
    WaitAndRestart,
    /// Cancel the previous invocation and start immediately.
    CancelPrevious,
    /// Cancel the previous invocation and start once it has finished.
    CancelAndWaitPrevious,
    /// Let both finish without conflict checks; the later commit wins.
    OverwritePrevious,
    /// No coordination.
    RunSideBySide,
}

impl Reentrance {
    /// Returns true for policies that may make a caller wait.
    pub fn may_wait(self) -> bool {
        matches!(self, Self::WaitAndRestart | Self::CancelAndWaitPrevious)
    }
}

pub(crate) struct InFlight {
    token: u64,
    txn: Arc<Transaction>,
    done: watch::Receiver<bool>,
}

/// Registration of one running invocation. Dropping it clears the token
/// and wakes every waiter.
pub(crate) struct Invocation {
    entry: Arc<CacheEntry>,
    token: u64,
    done: watch::Sender<bool>,
}

impl Drop for Invocation {
    fn drop(&mut self) {
        self.entry
            .state
            .lock()
            .in_flight
            .retain(|f| f.token != self.token);
        self.done.send_replace(true);
    }
}

/// Outcome of an admission check.
pub(crate) enum Admission {
    /// Run now. The listed transactions must be canceled first.
    Proceed {
        invocation: Invocation,
        cancel: Vec<Arc<Transaction>>,
    },
    /// Cancel the listed transactions, wait for the receivers, then retry.
    Wait {
        cancel: Vec<Arc<Transaction>>,
        waits: Vec<watch::Receiver<bool>>,
    },
}

/// Decides how an invocation of `entry` by `txn` proceeds.
pub(crate) fn admit(entry: &Arc<CacheEntry>, txn: &Arc<Transaction>) -> CoreResult<Admission> {
    let options = entry.options();
    let policy = options.reentrance;
    // Cached evaluations only write to the entry, so under the default
    // policy evaluations from different transactions run side by side and
    // only reentry from the same transaction is refused.
    let shared = options.kind == Kind::Cached && policy == Reentrance::PreventWithError;
    let mut state = entry.state.lock();
    let running: Vec<(Arc<Transaction>, watch::Receiver<bool>)> = state
        .in_flight
        .iter()
        .filter(|f| !*f.done.borrow() && !f.txn.is_finished())
        .filter(|f| !shared || f.txn.id() == txn.id())
        .map(|f| (Arc::clone(&f.txn), f.done.clone()))
        .collect();

    if let Some((prev, _)) = running.first() {
        let same = running.iter().any(|(t, _)| t.id() == txn.id());
        if policy == Reentrance::PreventWithError || (same && policy != Reentrance::RunSideBySide) {
            txn.stats().record_reentrance_rejection();
            return Err(CoreError::reentrance(entry.hint(), prev.to_string()));
        }
        match policy {
            Reentrance::WaitAndRestart => {
                return Ok(Admission::Wait {
                    cancel: Vec::new(),
                    waits: running.into_iter().map(|(_, w)| w).collect(),
                });
            }
            Reentrance::CancelAndWaitPrevious => {
                let (cancel, waits): (Vec<_>, Vec<_>) = running.into_iter().unzip();
                return Ok(Admission::Wait { cancel, waits });
            }
            Reentrance::OverwritePrevious | Reentrance::RunSideBySide => {
                for (t, _) in &running {
                    t.set_side_by_side();
                }
                txn.set_side_by_side();
            }
            Reentrance::CancelPrevious | Reentrance::PreventWithError => {}
        }
    }

    let cancel = if policy == Reentrance::CancelPrevious {
        running.into_iter().map(|(t, _)| t).collect()
    } else {
        Vec::new()
    };
    state.next_token += 1;
    let token = state.next_token;
    let (done, rx) = watch::channel(false);
    state.in_flight.push(InFlight {
        token,
        txn: Arc::clone(txn),
        done: rx,
    });
    drop(state);

    Ok(Admission::Proceed {
        invocation: Invocation {
            entry: Arc::clone(entry),
            token,
            done,
        },
        cancel,
    })
}

/// Cancels the transactions displaced by `txn`.
pub(crate) fn cancel_displaced(displaced: Vec<Arc<Transaction>>, entry: &CacheEntry, txn: &Transaction) {
    for prev in displaced {
        let reason = format!("{} was superseded by {}", entry.hint(), txn);
        prev.cancel(CoreError::canceled(reason), None);
    }
}

/// Admission for callers that cannot wait.
pub(crate) fn admit_now(entry: &Arc<CacheEntry>, txn: &Arc<Transaction>) -> CoreResult<Invocation> {
    match admit(entry, txn)? {
        Admission::Proceed { invocation, cancel } => {
            cancel_displaced(cancel, entry, txn);
            Ok(invocation)
        }
        Admission::Wait { .. } => {
            txn.stats().record_reentrance_rejection();
            Err(CoreError::reentrance(
                entry.hint(),
                "an in-flight invocation (synchronous callers cannot wait)",
            ))
        }
    }
}

/// Admission for async callers: waits as the policy requires.
///
/// `begin` is called for every attempt. When `owned` is set the attempt's
/// transaction belongs to this invocation and is abandoned before waiting,
/// so that the next attempt observes the state left by the invocations it
/// waited for.
pub(crate) async fn admit_async(
    entry: &Arc<CacheEntry>,
    owned: bool,
    mut begin: impl FnMut() -> Arc<Transaction>,
) -> CoreResult<(Arc<Transaction>, Invocation)> {
    loop {
        let txn = begin();
        match admit(entry, &txn) {
            Ok(Admission::Proceed { invocation, cancel }) => {
                cancel_displaced(cancel, entry, &txn);
                return Ok((txn, invocation));
            }
            Ok(Admission::Wait { cancel, mut waits }) => {
                cancel_displaced(cancel, entry, &txn);
                if owned {
                    txn.abandon();
                }
                for rx in &mut waits {
                    // A dropped sender means the invocation is gone.
                    let _ = rx.wait_for(|done| *done).await;
                }
            }
            Err(err) => {
                if owned {
                    txn.abandon();
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_prevents() {
        assert_eq!(Reentrance::default(), Reentrance::PreventWithError);
        assert!(Reentrance::WaitAndRestart.may_wait());
        assert!(Reentrance::CancelAndWaitPrevious.may_wait());
        assert!(!Reentrance::CancelPrevious.may_wait());
    }
}
