//! Events delivered by the remote event log.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque position in a stream's event log.
///
/// The server hands out event ids; the client only stores them and sends them
/// back. They carry no ordering the client may rely on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates an event id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Type of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Entity was created.
    Create,
    /// Entity was replaced by a new full body.
    Update,
    /// Only some fields of the entity changed.
    PartialUpdate,
    /// Entity was deleted. Carries no body.
    Delete,
}

impl Action {
    /// All actions in apply order.
    pub const ALL: [Action; 4] = [
        Action::Create,
        Action::Update,
        Action::PartialUpdate,
        Action::Delete,
    ];

    /// Converts to the numeric code used by the event log.
    pub fn to_code(&self) -> u8 {
        match self {
            Action::Delete => 0,
            Action::Create => 1,
            Action::Update => 2,
            Action::PartialUpdate => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        match code {
            0 => Ok(Action::Delete),
            1 => Ok(Action::Create),
            2 => Ok(Action::Update),
            3 => Ok(Action::PartialUpdate),
            other => Err(ProtocolError::UnknownAction(other)),
        }
    }

    /// Returns true for actions that carry an entity body.
    pub fn has_entity(&self) -> bool {
        !matches!(self, Action::Delete)
    }
}

/// One change notification for a single remote entity.
///
/// `entity_type` names the kind of entity (for example `"label"`) so each
/// listener can pick its own events out of a shared batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Entity type discriminator.
    pub entity_type: String,
    /// Remote key of the entity.
    pub key: String,
    /// What happened to the entity.
    pub action: Action,
    /// Serialized entity body, absent for deletes.
    pub raw_entity: Option<Vec<u8>>,
}

impl RawEvent {
    /// Creates a create event.
    pub fn create(entity_type: impl Into<String>, key: impl Into<String>, body: Vec<u8>) -> Self {
        Self::with_body(entity_type, key, Action::Create, body)
    }

    /// Creates an update event.
    pub fn update(entity_type: impl Into<String>, key: impl Into<String>, body: Vec<u8>) -> Self {
        Self::with_body(entity_type, key, Action::Update, body)
    }

    /// Creates a partial update event.
    pub fn partial_update(
        entity_type: impl Into<String>,
        key: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self::with_body(entity_type, key, Action::PartialUpdate, body)
    }

    /// Creates a delete event.
    pub fn delete(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: key.into(),
            action: Action::Delete,
            raw_entity: None,
        }
    }

    fn with_body(
        entity_type: impl Into<String>,
        key: impl Into<String>,
        action: Action,
        body: Vec<u8>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: key.into(),
            action,
            raw_entity: Some(body),
        }
    }

    /// Returns the size of the entity body in bytes.
    pub fn body_size(&self) -> usize {
        self.raw_entity.as_ref().map(|b| b.len()).unwrap_or(0)
    }
}
