//! # Ripple Testkit
//!
//! Test utilities for Ripple.
//!
//! This crate provides:
//! - Object models (`Demo`, `DemoView`, `AsyncDemo`) and engine helpers
//! - Property-based test generators using proptest
//! - Multi-threaded stress runs over conflicting transactions
//! - Log output for tests through `tracing-subscriber`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ripple_testkit::prelude::*;
//!
//! #[test]
//! fn render_follows_title() {
//!     init_tracing();
//!     let engine = Engine::new();
//!     let demo = create_demo(&engine, &demo_type(), "Demo").unwrap();
//!     assert!(engine.call(&demo, "render", &[]).unwrap().to_string().contains("Demo"));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::stress::*;
    pub use ripple_core::{
        CacheOptions, CoreError, CoreResult, Engine, ObjectHandle, ObjectType, Reentrance, Value,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use stress::*;
