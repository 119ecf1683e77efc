//! Operation options.

use crate::journal::Journal;
use crate::monitor::Monitor;
use crate::reentrance::Reentrance;
use std::sync::Arc;
use std::time::Duration;

/// Kind of a declared member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Plain reactive field.
    Field,
    /// Operation that always runs and may write fields.
    Transaction,
    /// Operation re-run automatically after the commit that invalidates it.
    Trigger,
    /// Memoized operation re-evaluated lazily when invalid.
    Cached,
}

/// Minimum spacing between automatic re-runs of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttling {
    /// Run right after the invalidating commit.
    Immediate,
    /// Run no sooner than this long after the previous run.
    Delay(Duration),
    /// Never run automatically.
    Never,
}

impl Throttling {
    /// Converts the millisecond encoding: `-1` is immediate, `i64::MAX` is
    /// never, anything else is a delay (negative values clamp to immediate).
    #[must_use]
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            i64::MAX => Self::Never,
            ms if ms < 0 => Self::Immediate,
            ms => Self::Delay(Duration::from_millis(ms.unsigned_abs())),
        }
    }
}

/// Options of a declared operation.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Operation kind. Set by the declaring builder method.
    pub kind: Kind,
    /// Trigger priority; higher runs earlier.
    pub priority: i32,
    /// Whether writes are forbidden inside the operation.
    pub no_side_effects: bool,
    /// Whether arguments are compared by value rather than identity.
    pub sensitive_args: bool,
    /// Trigger re-run throttling.
    pub throttling: Throttling,
    /// Policy for overlapping invocations.
    pub reentrance: Reentrance,
    /// Journal receiving commits of transactions started by this operation.
    pub journal: Option<Arc<Journal>>,
    /// Monitor counting in-flight invocations.
    pub monitor: Option<Arc<Monitor>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            kind: Kind::Transaction,
            priority: 0,
            no_side_effects: false,
            sensitive_args: false,
            throttling: Throttling::Immediate,
            reentrance: Reentrance::PreventWithError,
            journal: None,
            monitor: None,
        }
    }
}

impl CacheOptions {
    /// Default options for a transactional operation.
    #[must_use]
    pub fn transaction() -> Self {
        Self::default()
    }

    /// Default options for a trigger.
    #[must_use]
    pub fn trigger() -> Self {
        Self {
            kind: Kind::Trigger,
            ..Self::default()
        }
    }

    /// Default options for a cached operation. Cached operations are pure.
    #[must_use]
    pub fn cached() -> Self {
        Self {
            kind: Kind::Cached,
            no_side_effects: true,
            ..Self::default()
        }
    }

    /// Sets the trigger priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets whether writes are forbidden.
    #[must_use]
    pub fn no_side_effects(mut self, value: bool) -> Self {
        self.no_side_effects = value;
        self
    }

    /// Sets whether arguments are compared by value.
    #[must_use]
    pub fn sensitive_args(mut self, value: bool) -> Self {
        self.sensitive_args = value;
        self
    }

    /// Sets the trigger throttling.
    #[must_use]
    pub fn throttling(mut self, throttling: Throttling) -> Self {
        self.throttling = throttling;
        self
    }

    /// Sets the reentrance policy.
    #[must_use]
    pub fn reentrance(mut self, reentrance: Reentrance) -> Self {
        self.reentrance = reentrance;
        self
    }

    /// Binds a journal.
    #[must_use]
    pub fn journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Binds a monitor.
    #[must_use]
    pub fn monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }
}
