//! # Ripple Core
//!
//! Transactional reactive object-state engine.
//!
//! This crate provides:
//! - Versioned records with snapshot-isolated reads
//! - Transactions with nested runs, async continuation, cancellation and
//!   optimistic conflict detection at apply time
//! - Reentrance policies for overlapping invocations of one operation
//! - Memoized operations invalidated by the commits that change what they
//!   read, and triggers re-run after such commits
//! - Monitors, a commit journal and statistics
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ripple_core::{CacheOptions, Engine, ObjectType, Value};
//!
//! let demo = ObjectType::builder("Demo")
//!     .field("title")
//!     .cached("render", CacheOptions::cached(), |ctx, this, _| {
//!         Ok(Value::from(format!("<h1>{}</h1>", ctx.get(this, "title")?)))
//!     })
//!     .build();
//!
//! let engine = Engine::new();
//! let obj = engine.transaction("create", |ctx| ctx.create(&demo, [("title", Value::from("Demo"))]))?;
//! let html = engine.call(&obj, "render", &[])?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod engine;
mod error;
mod journal;
mod monitor;
mod object;
mod reentrance;
mod snapshot;
mod stats;
mod transaction;
mod types;
mod value;

pub use cache::{CacheHandle, CacheOptions, Kind, Throttling};
pub use config::Config;
pub use engine::Engine;
pub use error::{CoreError, CoreResult};
pub use journal::{CommitEvent, FieldChange, Journal};
pub use monitor::{Monitor, MonitorGuard};
pub use object::{AsyncBody, BoxFuture, ObjectHandle, ObjectType, ObjectTypeBuilder, Operation, SyncBody};
pub use reentrance::Reentrance;
pub use stats::{EngineStats, StatsSnapshot};
pub use transaction::{Context, Transaction, TransactionOptions, TransactionStatus, WorkerGuard};
pub use types::{CacheId, FieldKey, ObjectId, SnapshotId, Stamp};
pub use value::Value;
