//! Commit journal for observing applied transactions.
//!
//! Every applied snapshot produces one [`CommitEvent`] listing the fields it
//! changed together with their previous and new values. The engine owns a
//! global journal; transactions and operations may bind their own, which is
//! how an undo/redo history subscribes only to the edits it cares about.
//!
//! # Usage
//!
//! ```rust,ignore
//! let rx = engine.journal().subscribe();
//! std::thread::spawn(move || {
//!     while let Ok(event) = rx.recv() {
//!         for change in &event.changes {
//!             println!("{}.{}: {:?} -> {}", change.object, change.field, change.old, change.new);
//!         }
//!     }
//! });
//! ```

use crate::types::{FieldKey, ObjectId, SnapshotId, Stamp};
use crate::value::Value;
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// One field change within a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Object whose field changed.
    pub object: ObjectId,
    /// Field name.
    pub field: FieldKey,
    /// Value before the commit. `None` when the field was first assigned.
    pub old: Option<Value>,
    /// Value after the commit.
    pub new: Value,
}

/// All field changes of one applied snapshot.
///
/// Events are emitted only after apply, in stamp order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    /// Commit stamp assigned at apply.
    pub stamp: Stamp,
    /// Snapshot that was applied.
    pub snapshot: SnapshotId,
    /// Transaction hint.
    pub hint: String,
    /// Changed fields.
    pub changes: Vec<FieldChange>,
}

impl CommitEvent {
    /// Returns the change of a specific field, if this commit made one.
    pub fn change(&self, object: ObjectId, field: &str) -> Option<&FieldChange> {
        self.changes
            .iter()
            .find(|c| c.object == object && &*c.field == field)
    }
}

/// A journal that distributes commit events to subscribers.
///
/// The journal preserves commit order, supports multiple subscribers, keeps
/// a bounded history for polling, and is thread-safe.
pub struct Journal {
    subscribers: RwLock<Vec<Sender<CommitEvent>>>,
    history: RwLock<Vec<CommitEvent>>,
    max_history: usize,
}

impl Journal {
    /// Creates a new journal.
    pub fn new() -> Self {
        Self::with_max_history(10_000)
    }

    /// Creates a journal with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to the journal.
    ///
    /// Returns a receiver that will receive all future commit events.
    pub fn subscribe(&self) -> Receiver<CommitEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a commit event to all subscribers.
    pub fn emit(&self, event: CommitEvent) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let to_remove = history.len() - self.max_history;
                history.drain(0..to_remove);
            }
        }

        // Disconnected subscribers are dropped here.
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Polls events with stamp greater than `cursor`, up to `limit`.
    pub fn poll(&self, cursor: Stamp, limit: usize) -> Vec<CommitEvent> {
        let history = self.history.read();
        history
            .iter()
            .filter(|e| e.stamp > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest stamp in history.
    pub fn latest_stamp(&self) -> Stamp {
        self.history
            .read()
            .last()
            .map_or(Stamp::ZERO, |e| e.stamp)
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns the number of events in history.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Clears history older than the given stamp.
    pub fn truncate_history(&self, min_stamp: Stamp) {
        let mut history = self.history.write();
        history.retain(|e| e.stamp >= min_stamp);
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("history_len", &self.history_len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
