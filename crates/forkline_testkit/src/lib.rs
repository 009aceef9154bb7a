//! # Forkline Testkit
//!
//! Test utilities for forkline.
//!
//! This crate provides:
//! - A test document type and a fork/meta/master harness
//! - Master handlers that inject transport faults and contract violations
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use forkline_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_replication() {
//!     let harness = ReplicationHarness::new();
//!     harness.write_fork(doc("a", "red")).await;
//!     let state = harness.start("test").await;
//!     state.await_in_sync().await.unwrap();
//!     assert!(harness.is_converged());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use logging::*;
