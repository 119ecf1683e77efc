//! Core type definitions for Ripple.

use std::fmt;
use std::sync::Arc;

/// Name of a reactive field.
///
/// Field names are shared between every record of an object, so they are
/// reference counted rather than copied.
pub type FieldKey = Arc<str>;

/// Stable identity of a reactive object.
///
/// Object IDs are assigned at construction and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Creates a new object ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Identifier of a snapshot (and of the transaction that owns it).
///
/// Snapshot IDs strictly increase with acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// Creates a new snapshot ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Commit stamp establishing the total order of applied snapshots.
///
/// A snapshot started at stamp `s` sees exactly the records applied with
/// stamps `<= s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(pub u64);

impl Stamp {
    /// The stamp of the blank record every object starts from.
    pub const ZERO: Stamp = Stamp(0);

    /// Stamp carried by records that have not been applied yet.
    pub const UNCOMMITTED: Stamp = Stamp(u64::MAX);

    /// Creates a new stamp.
    #[must_use]
    pub const fn new(stamp: u64) -> Self {
        Self(stamp)
    }

    /// Returns the raw stamp value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next stamp.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNCOMMITTED {
            f.write_str("ts:-")
        } else {
            write!(f, "ts:{}", self.0)
        }
    }
}

/// Identifier of a cache entry.
///
/// Cache IDs also encode registration order, which breaks ties between
/// triggers of equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheId(pub u64);

impl CacheId {
    /// Creates a new cache ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache:{}", self.0)
    }
}
