//! # evsync Engine
//!
//! Event-log synchronization engine.
//!
//! This crate provides:
//! - Entity listeners with dependency-ordered, transactional batch apply
//! - Per-stream engine state machine (stopped ↔ started, suspend, cancel)
//! - Checkpoint management and full resync on checkpoint invalidation
//! - Remote event API abstraction with HTTP and mock implementations
//! - Local store abstraction with an in-memory, optionally persisted store
//!
//! ## Architecture
//!
//! One `process()` run per stream:
//! 1. Load the checkpoint; without one, store the server's latest id and stop
//! 2. Fetch the next page of events since the checkpoint
//! 3. Let every listener of the stream kind deserialize its events
//! 4. Prepare upserts outside any transaction
//! 5. Apply creates/updates ascending by listener order, deletes descending,
//!    and write the new checkpoint, all in one transaction
//! 6. Repeat while the server reports more events
//!
//! ## Key Invariants
//!
//! - Server is authoritative
//! - At most one checkpoint per stream, advanced only by a committed batch
//! - A failed batch leaves no partial writes
//! - Batch buckets live for exactly one page of one run
//! - At most one run per stream at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api;
mod batch;
mod config;
mod engine;
mod error;
mod http;
mod listener;
mod registry;
mod store;

pub use api::{ApiCall, EventApi, MockEventApi};
pub use batch::{ActionBucket, TypedEvent};
pub use config::EngineConfig;
pub use engine::{EngineState, EngineStats, ProcessResult, SkipReason, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use http::{
    encode_segment, stream_path, HttpClient, HttpEventApi, HttpResponse, LoopbackClient,
    LoopbackServer,
};
pub use listener::{
    EntityListener, ListenerBucket, ListenerInfo, ListenerRegistry, ListenerRegistryBuilder,
    TypedEvents,
};
pub use registry::EngineRegistry;
pub use store::{LocalStore, MemoryStore, StoreTransaction};
