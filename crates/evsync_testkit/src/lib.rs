//! # evsync Testkit
//!
//! Test utilities for evsync.
//!
//! This crate provides:
//! - An in-memory reference event log server speaking the HTTP wire format
//! - Recording listeners with a shared, ordered call log
//! - Engine fixtures and a JSON replay format
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use evsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn applies_in_order() {
//!     let chain = ListenerChain::new(StreamKind::Core);
//!     let (engine, api, store) =
//!         mock_engine(SyncStreamId::core("u1"), &chain.registry, EngineConfig::default());
//!     // ... queue pages on `api`, run `engine.process()`, inspect `chain.log`
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod listeners;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_test_tracing;
    pub use crate::listeners::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use generators::*;
pub use listeners::*;
pub use server::*;

/// Installs a `tracing` subscriber for tests.
///
/// Honors `RUST_LOG`; defaults to `debug` for evsync crates. Safe to call
/// from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("evsync_engine=debug,evsync_scheduler=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
