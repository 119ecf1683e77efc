//! Object types: the per-type registry of fields and operations.
//!
//! An [`ObjectType`] is built once and shared by every object of that type.
//! It lists the declared reactive fields (reading one before its first
//! assignment fails), the stateless members kept outside versioning, and the
//! operations with their [`CacheOptions`].
//!
//! ```rust,ignore
//! let demo = ObjectType::builder("Demo")
//!     .field("title")
//!     .transaction("rename", CacheOptions::transaction(), |ctx, this, args| {
//!         ctx.set(this, "title", args[0].clone())?;
//!         Ok(Value::Null)
//!     })
//!     .cached("render", CacheOptions::cached(), |ctx, this, _| {
//!         Ok(Value::from(format!("<h1>{}</h1>", ctx.get(this, "title")?)))
//!     })
//!     .build();
//! ```

use crate::cache::options::{CacheOptions, Kind};
use crate::error::CoreResult;
use crate::object::handle::ObjectHandle;
use crate::transaction::Context;
use crate::types::FieldKey;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Body of a synchronous operation.
pub type SyncBody = Arc<dyn Fn(&Context, &ObjectHandle, &[Value]) -> CoreResult<Value> + Send + Sync>;

/// Body of an asynchronous operation.
pub type AsyncBody =
    Arc<dyn Fn(Context, ObjectHandle, Vec<Value>) -> BoxFuture<CoreResult<Value>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Body {
    Sync(SyncBody),
    Async(AsyncBody),
}

/// A declared operation.
pub struct Operation {
    name: Arc<str>,
    ty: Arc<str>,
    options: CacheOptions,
    pub(crate) body: Body,
}

impl Operation {
    /// Returns the operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared options.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Returns the operation kind.
    pub fn kind(&self) -> Kind {
        self.options.kind
    }

    /// Returns true for asynchronous operations.
    pub fn is_async(&self) -> bool {
        matches!(self.body, Body::Async(_))
    }

    /// Returns `Type.op`, used in hints and errors.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.ty, self.name)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.qualified_name())
            .field("kind", &self.options.kind)
            .field("async", &self.is_async())
            .finish()
    }
}

/// Per-type registry of fields and operations.
#[derive(Debug)]
pub struct ObjectType {
    name: Arc<str>,
    fields: Vec<FieldKey>,
    stateless: Vec<String>,
    operations: Vec<Arc<Operation>>,
    by_name: HashMap<String, usize>,
}

impl ObjectType {
    /// Starts building a type.
    pub fn builder(name: &str) -> ObjectTypeBuilder {
        ObjectTypeBuilder {
            name: Arc::from(name),
            fields: Vec::new(),
            stateless: Vec::new(),
            operations: Vec::new(),
        }
    }

    /// Returns the type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared reactive fields in declaration order.
    pub fn fields(&self) -> &[FieldKey] {
        &self.fields
    }

    /// Returns the shared key of a declared reactive field.
    pub fn field(&self, name: &str) -> Option<&FieldKey> {
        self.fields.iter().find(|f| &***f == name)
    }

    /// Returns true if `name` is a declared stateless member.
    pub fn is_stateless(&self, name: &str) -> bool {
        self.stateless.iter().any(|s| s == name)
    }

    /// Looks up an operation by name.
    pub fn operation(&self, name: &str) -> Option<&Arc<Operation>> {
        self.by_name.get(name).map(|&i| &self.operations[i])
    }

    /// Returns all operations in declaration order.
    pub fn operations(&self) -> &[Arc<Operation>] {
        &self.operations
    }

    /// Returns the trigger operations.
    pub fn triggers(&self) -> impl Iterator<Item = &Arc<Operation>> {
        self.operations
            .iter()
            .filter(|op| op.kind() == Kind::Trigger)
    }
}

/// Builder for [`ObjectType`].
pub struct ObjectTypeBuilder {
    name: Arc<str>,
    fields: Vec<FieldKey>,
    stateless: Vec<String>,
    operations: Vec<(Arc<str>, CacheOptions, Body)>,
}

impl ObjectTypeBuilder {
    /// Declares a reactive field.
    #[must_use]
    pub fn field(mut self, name: &str) -> Self {
        if !self.fields.iter().any(|f| &**f == name) {
            self.fields.push(Arc::from(name));
        }
        self
    }

    /// Declares a stateless member (not versioned, not tracked).
    #[must_use]
    pub fn stateless(mut self, name: &str) -> Self {
        self.stateless.push(name.to_string());
        self
    }

    /// Declares a synchronous transactional operation.
    #[must_use]
    pub fn transaction<F>(self, name: &str, options: CacheOptions, body: F) -> Self
    where
        F: Fn(&Context, &ObjectHandle, &[Value]) -> CoreResult<Value> + Send + Sync + 'static,
    {
        self.sync_op(name, Kind::Transaction, options, body)
    }

    /// Declares an asynchronous transactional operation.
    #[must_use]
    pub fn transaction_async<F, Fut>(self, name: &str, options: CacheOptions, body: F) -> Self
    where
        F: Fn(Context, ObjectHandle, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        self.async_op(name, Kind::Transaction, options, body)
    }

    /// Declares a synchronous cached operation.
    #[must_use]
    pub fn cached<F>(self, name: &str, options: CacheOptions, body: F) -> Self
    where
        F: Fn(&Context, &ObjectHandle, &[Value]) -> CoreResult<Value> + Send + Sync + 'static,
    {
        self.sync_op(name, Kind::Cached, options, body)
    }

    /// Declares an asynchronous cached operation.
    #[must_use]
    pub fn cached_async<F, Fut>(self, name: &str, options: CacheOptions, body: F) -> Self
    where
        F: Fn(Context, ObjectHandle, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        self.async_op(name, Kind::Cached, options, body)
    }

    /// Declares a synchronous trigger.
    #[must_use]
    pub fn trigger<F>(self, name: &str, options: CacheOptions, body: F) -> Self
    where
        F: Fn(&Context, &ObjectHandle, &[Value]) -> CoreResult<Value> + Send + Sync + 'static,
    {
        self.sync_op(name, Kind::Trigger, options, body)
    }

    /// Declares an asynchronous trigger.
    #[must_use]
    pub fn trigger_async<F, Fut>(self, name: &str, options: CacheOptions, body: F) -> Self
    where
        F: Fn(Context, ObjectHandle, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        self.async_op(name, Kind::Trigger, options, body)
    }

    fn sync_op<F>(self, name: &str, kind: Kind, options: CacheOptions, body: F) -> Self
    where
        F: Fn(&Context, &ObjectHandle, &[Value]) -> CoreResult<Value> + Send + Sync + 'static,
    {
        self.push(name, kind, options, Body::Sync(Arc::new(body)))
    }

    fn async_op<F, Fut>(self, name: &str, kind: Kind, options: CacheOptions, body: F) -> Self
    where
        F: Fn(Context, ObjectHandle, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        let body: AsyncBody = Arc::new(
            move |ctx: Context, this: ObjectHandle, args: Vec<Value>| -> BoxFuture<CoreResult<Value>> {
                Box::pin(body(ctx, this, args))
            },
        );
        self.push(name, kind, options, Body::Async(body))
    }

    fn push(mut self, name: &str, kind: Kind, mut options: CacheOptions, body: Body) -> Self {
        options.kind = kind;
        // Redeclaring an operation replaces it.
        self.operations.retain(|(n, _, _)| &**n != name);
        self.operations.push((Arc::from(name), options, body));
        self
    }

    /// Finishes the type.
    pub fn build(self) -> Arc<ObjectType> {
        let operations: Vec<Arc<Operation>> = self
            .operations
            .into_iter()
            .map(|(name, options, body)| {
                Arc::new(Operation {
                    name,
                    ty: Arc::clone(&self.name),
                    options,
                    body,
                })
            })
            .collect();
        let by_name = operations
            .iter()
            .enumerate()
            .map(|(i, op)| (op.name().to_string(), i))
            .collect();
        Arc::new(ObjectType {
            name: self.name,
            fields: self.fields,
            stateless: self.stateless,
            operations,
            by_name,
        })
    }
}
