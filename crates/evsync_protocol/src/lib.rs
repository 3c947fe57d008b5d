//! # evsync Protocol
//!
//! Value types and wire messages shared by the evsync engine, scheduler and
//! test servers.
//!
//! This crate provides:
//! - `SyncStreamId`, the durable identity of one independent sync stream
//! - `EventId`, `Action` and `RawEvent` as delivered by the remote event log
//! - `EventBatch`, `LatestEventResponse` and `ErrorBody` wire messages
//! - Canonical CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod messages;
mod stream;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{Action, EventId, RawEvent};
pub use messages::{EventBatch, ErrorBody, LatestEventResponse};
pub use stream::{CalendarId, ShareId, StreamKind, SyncStreamId, UserId};
