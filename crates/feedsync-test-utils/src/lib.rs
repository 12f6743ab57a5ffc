//! Shared test utilities for feedsync integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory storage with operation recording and
//!   failure injection
//! - [`ScriptedFeed`] and [`StaticAuditSource`]: in-memory change sources
//! - [`TestContext`] and factory functions for packages and deletions
//!
//! # Example
//!
//! ```rust,ignore
//! use feedsync_test_utils::{TestContext, ScriptedFeed, at, package};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     let feed = ScriptedFeed::with_packages([package("A", "1.0.0", at(1))]);
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod feed;
pub mod fixtures;
pub mod storage;

pub use feed::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("feedsync=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
