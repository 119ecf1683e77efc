//! Reactive objects: types, handles and the versioned record store.

pub(crate) mod handle;
pub(crate) mod record;
pub(crate) mod schema;

pub use handle::ObjectHandle;
pub use schema::{AsyncBody, BoxFuture, ObjectType, ObjectTypeBuilder, Operation, SyncBody};
