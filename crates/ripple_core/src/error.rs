//! Error types for Ripple core.

use crate::types::SnapshotId;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Ripple core operations.
///
/// Errors are cloneable: a captured error is stored on the canceled
/// transaction and on the errored cache entry, and every waiter receives
/// its own copy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// A declared reactive field was read before it was ever assigned.
    #[error("uninitialized field: {ty}.{field}")]
    UninitializedField {
        /// Object type name.
        ty: String,
        /// Field name.
        field: String,
    },

    /// A field that the object type does not declare.
    #[error("unknown field: {ty}.{field}")]
    UnknownField {
        /// Object type name.
        ty: String,
        /// Field name.
        field: String,
    },

    /// An operation was invoked while a previous invocation is in flight.
    #[error("{operation} is not reentrant over {existing}")]
    Reentrance {
        /// Operation description (`Type.op`).
        operation: String,
        /// Hint of the in-flight transaction.
        existing: String,
    },

    /// Optimistic conflict detected at seal time.
    #[error("{transaction} conflicts with: {}", .fields.join(", "))]
    Conflict {
        /// Hint of the discarded transaction.
        transaction: String,
        /// Conflicting fields as `Type.field`.
        fields: Vec<String>,
    },

    /// Work was attempted on a transaction that has already sealed.
    #[error("transaction {snapshot} ({hint}) is sealed")]
    TransactionSealed {
        /// Snapshot of the sealed transaction.
        snapshot: SnapshotId,
        /// Hint of the sealed transaction.
        hint: String,
    },

    /// The transaction was canceled.
    #[error("transaction canceled: {reason}")]
    Canceled {
        /// Reason for cancellation.
        reason: String,
    },

    /// The object type declares no operation with this name.
    #[error("unknown operation: {ty}.{operation}")]
    UnknownOperation {
        /// Object type name.
        ty: String,
        /// Operation name.
        operation: String,
    },

    /// The object has been unmounted.
    #[error("object {object} is unmounted")]
    ObjectUnmounted {
        /// Object description.
        object: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// An operation body failed.
    #[error("{message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates an uninitialized field error.
    pub fn uninitialized_field(ty: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UninitializedField {
            ty: ty.into(),
            field: field.into(),
        }
    }

    /// Creates an unknown field error.
    pub fn unknown_field(ty: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            ty: ty.into(),
            field: field.into(),
        }
    }

    /// Creates a reentrance error.
    pub fn reentrance(operation: impl Into<String>, existing: impl Into<String>) -> Self {
        Self::Reentrance {
            operation: operation.into(),
            existing: existing.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(transaction: impl Into<String>, fields: Vec<String>) -> Self {
        Self::Conflict {
            transaction: transaction.into(),
            fields,
        }
    }

    /// Creates a sealed transaction error.
    pub fn sealed(snapshot: SnapshotId, hint: impl Into<String>) -> Self {
        Self::TransactionSealed {
            snapshot,
            hint: hint.into(),
        }
    }

    /// Creates a cancellation error.
    pub fn canceled(reason: impl Into<String>) -> Self {
        Self::Canceled {
            reason: reason.into(),
        }
    }

    /// Creates an unknown operation error.
    pub fn unknown_operation(ty: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnknownOperation {
            ty: ty.into(),
            operation: operation.into(),
        }
    }

    /// Creates an object unmounted error.
    pub fn unmounted(object: impl Into<String>) -> Self {
        Self::ObjectUnmounted {
            object: object.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a body failure error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Returns true for cancellation errors.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Returns true for conflict errors.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true for reentrance errors.
    pub fn is_reentrance(&self) -> bool {
        matches!(self, Self::Reentrance { .. })
    }
}
