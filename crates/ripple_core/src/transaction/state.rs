//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::transaction::Transaction;
use std::sync::Arc;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Work is in progress (possibly sealed, waiting for workers).
    Running,
    /// Sealed with no workers left; being rebased and applied.
    Sealing,
    /// Changes were applied.
    Applied,
    /// Changes were discarded.
    Discarded,
}

impl TransactionStatus {
    /// Returns true for `Applied` and `Discarded`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Discarded)
    }
}

/// Options for starting a transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Diagnostic hint.
    pub hint: String,
    /// Ignore conflicts at seal time; overlapping fields take this
    /// transaction's values.
    pub side_by_side: bool,
    /// Journal receiving this transaction's commit event.
    pub journal: Option<Arc<Journal>>,
}

impl TransactionOptions {
    /// Creates options with a hint.
    pub fn new(hint: impl Into<String>) -> Self {
        Self {
            hint: hint.into(),
            ..Self::default()
        }
    }

    /// Sets side-by-side mode.
    #[must_use]
    pub fn side_by_side(mut self, value: bool) -> Self {
        self.side_by_side = value;
        self
    }

    /// Binds a journal.
    #[must_use]
    pub fn journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Binds a journal if one is given.
    #[must_use]
    pub(crate) fn maybe_journal(mut self, journal: Option<Arc<Journal>>) -> Self {
        if journal.is_some() {
            self.journal = journal;
        }
        self
    }
}

/// Mutable part of a transaction, guarded by one lock.
pub(crate) struct TxState {
    pub(crate) workers: usize,
    pub(crate) sealed: bool,
    pub(crate) error: Option<CoreError>,
    /// Transaction to wait for before replaying a canceled invocation.
    pub(crate) restart_after: Option<Arc<Transaction>>,
    pub(crate) side_by_side: bool,
    pub(crate) status: TransactionStatus,
    pub(crate) outcome: Option<CoreResult<()>>,
}

impl TxState {
    pub(crate) fn new(side_by_side: bool) -> Self {
        Self {
            workers: 0,
            sealed: false,
            error: None,
            restart_after: None,
            side_by_side,
            status: TransactionStatus::Running,
            outcome: None,
        }
    }

    /// Sealed with no workers, and not yet claimed by a finisher.
    pub(crate) fn ready_to_finish(&self) -> bool {
        self.sealed && self.workers == 0 && self.status == TransactionStatus::Running
    }
}
