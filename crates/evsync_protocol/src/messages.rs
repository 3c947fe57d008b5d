//! Wire messages of the event log API.
//!
//! Bodies travel as canonical CBOR. Every message has an `encode`/`decode`
//! pair; decoding is tolerant of unknown fields so the server may add new ones.

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{EventId, RawEvent};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}

/// Response of `GET …/events/latest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestEventResponse {
    /// Current head of the stream's event log.
    pub event_id: EventId,
}

impl LatestEventResponse {
    /// Creates a new response.
    pub fn new(event_id: EventId) -> Self {
        Self { event_id }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Response of `GET …/events/{since}`: one page of the event diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Events after `since`, in log order.
    #[serde(default)]
    pub events: Vec<RawEvent>,
    /// Position to resume from after applying `events`.
    pub next_event_id: EventId,
    /// Whether more events remain after `next_event_id`.
    #[serde(default)]
    pub more: bool,
    /// The server asks the client to discard local state and start over.
    #[serde(default)]
    pub refresh: bool,
}

impl EventBatch {
    /// Creates a new batch.
    pub fn new(events: Vec<RawEvent>, next_event_id: EventId, more: bool) -> Self {
        Self {
            events,
            next_event_id,
            more,
            refresh: false,
        }
    }

    /// Creates a batch that only tells the client to resync from scratch.
    pub fn refresh(next_event_id: EventId) -> Self {
        Self {
            events: Vec::new(),
            next_event_id,
            more: false,
            refresh: true,
        }
    }

    /// Returns true if the batch carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the events of one entity type.
    pub fn events_of<'a>(&'a self, entity_type: &'a str) -> impl Iterator<Item = &'a RawEvent> + 'a {
        self.events
            .iter()
            .filter(move |event| event.entity_type == entity_type)
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Error payload returned with a non-success HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Application error code.
    pub code: u32,
    /// Human readable message.
    #[serde(default)]
    pub error: String,
}

impl ErrorBody {
    /// The `since` event id is unknown or has been garbage-collected.
    pub const CODE_EVENT_ID_INVALID: u32 = 2501;

    /// Creates a new error body.
    pub fn new(code: u32, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }

    /// Returns true if the error invalidates the client's checkpoint.
    pub fn invalidates_checkpoint(&self) -> bool {
        self.code == Self::CODE_EVENT_ID_INVALID
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}
