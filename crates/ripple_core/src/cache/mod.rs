//! Cache and dependency engine.
//!
//! Every operation on every object has one cache entry. Evaluations record
//! the field values and cache results they read; the entry subscribes to
//! them when its result is published, and a commit that supersedes any of
//! them marks the entry invalid, cascading to entries that read it.
//! Invalidated triggers are queued and re-run.

pub(crate) mod entry;
mod invoke;
pub(crate) mod options;
pub(crate) mod trigger;

pub use options::{CacheOptions, Kind, Throttling};

use crate::engine::Engine;
use crate::error::CoreResult;
use crate::types::{CacheId, FieldKey, ObjectId};
use crate::value::Value;
use entry::CacheEntry;
use std::fmt;
use std::sync::Arc;

/// Marks `entries` invalid, then every entry that observed them.
///
/// Returns the entries that turned invalid.
pub(crate) fn invalidate_all(entries: Vec<Arc<CacheEntry>>) -> Vec<Arc<CacheEntry>> {
    let mut invalidated = Vec::new();
    let mut stack = entries;
    while let Some(entry) = stack.pop() {
        if let Some(observers) = entry.mark_invalid() {
            stack.extend(observers);
            invalidated.push(entry);
        }
    }
    invalidated
}

/// Handle to one operation's cache entry.
#[derive(Clone)]
pub struct CacheHandle {
    entry: Arc<CacheEntry>,
    engine: Engine,
}

impl CacheHandle {
    pub(crate) fn new(entry: Arc<CacheEntry>, engine: Engine) -> Self {
        Self { entry, engine }
    }

    /// Returns the cache ID.
    pub fn id(&self) -> CacheId {
        self.entry.id
    }

    /// Returns `Type#id.op`.
    pub fn hint(&self) -> String {
        self.entry.hint()
    }

    /// Returns true unless a valid result is memoized.
    pub fn is_invalid(&self) -> bool {
        !self.entry.is_valid()
    }

    /// Returns true while an invocation is in flight.
    pub fn is_running(&self) -> bool {
        self.entry.is_running()
    }

    /// Returns the last stored result, valid or not.
    pub fn last_result(&self) -> Option<CoreResult<Value>> {
        self.entry.last_result()
    }

    /// Returns the fields the last published result depends on, including
    /// those read through other cache entries.
    pub fn dependencies(&self) -> Vec<(ObjectId, FieldKey)> {
        self.entry.deps()
    }

    /// Returns the effective options.
    pub fn options(&self) -> CacheOptions {
        self.entry.options()
    }

    /// Adjusts the options of this entry. The kind cannot change.
    pub fn configure(&self, f: impl FnOnce(&mut CacheOptions)) {
        self.entry.configure(f);
    }

    /// Marks the entry and its dependents invalid. Invalidated triggers are
    /// queued and the queue is drained.
    pub fn invalidate(&self) {
        let invalidated = invalidate_all(vec![Arc::clone(&self.entry)]);
        if invalidated.is_empty() {
            return;
        }
        self.engine.stats().record_invalidations(invalidated.len() as u64);
        self.engine.schedule(
            invalidated
                .into_iter()
                .filter(|e| e.options().kind == Kind::Trigger)
                .collect(),
        );
        self.engine.run_pending_triggers();
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("id", &self.entry.id)
            .field("hint", &self.entry.hint())
            .finish()
    }
}
