//! Sync stream identities.
//!
//! A [`SyncStreamId`] names one independent, checkpointed consumer of the
//! remote event log. Its text form is a durable key: it is used for the local
//! checkpoint record, the scheduler job name and the job tag set, so the
//! format produced by [`SyncStreamId::key`] must never change.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new id from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of the account owning a stream.
    UserId
);
string_id!(
    /// Identifier of a calendar.
    CalendarId
);
string_id!(
    /// Identifier of a shared drive volume.
    ShareId
);

/// The kind of resource graph a stream synchronizes.
///
/// Listeners register against a kind and participate in every stream of that
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Core account data.
    Core,
    /// One calendar.
    Calendar,
    /// One drive share.
    Drive,
}

impl StreamKind {
    /// All stream kinds.
    pub const ALL: [StreamKind; 3] = [StreamKind::Core, StreamKind::Calendar, StreamKind::Drive];

    /// Returns the stable name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Core => "core",
            StreamKind::Calendar => "calendar",
            StreamKind::Drive => "drive",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s {
            "core" => Ok(StreamKind::Core),
            "calendar" => Ok(StreamKind::Calendar),
            "drive" => Ok(StreamKind::Drive),
            other => Err(ProtocolError::UnknownStreamKind(other.to_string())),
        }
    }
}

/// Identity of one independent sync stream.
///
/// # Text form
///
/// | Variant | Key |
/// |---|---|
/// | `Core` | `core:{user}` |
/// | `Calendar` | `calendar:{user}:{calendar}:{api_version}` |
/// | `Drive` | `drive:{user}:{share}` |
///
/// `%` and `:` inside components are percent-escaped, so any component value
/// round-trips through [`SyncStreamId::key`] and [`FromStr`].
///
/// # Example
///
/// ```
/// use evsync_protocol::{SyncStreamId, UserId};
///
/// let id = SyncStreamId::core("user-1");
/// assert_eq!(id.key(), "core:user-1");
/// assert_eq!(id.key().parse::<SyncStreamId>().unwrap(), id);
/// assert_eq!(id.user_id(), &UserId::new("user-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SyncStreamId {
    /// The user's core account stream.
    Core {
        /// Owning user.
        user_id: UserId,
    },
    /// One calendar's model event stream.
    Calendar {
        /// Owning user.
        user_id: UserId,
        /// Calendar whose events are consumed.
        calendar_id: CalendarId,
        /// Calendar event API version.
        api_version: u32,
    },
    /// One drive share's event stream.
    Drive {
        /// Owning user.
        user_id: UserId,
        /// Share whose events are consumed.
        share_id: ShareId,
    },
}

impl SyncStreamId {
    /// Creates a core stream id.
    pub fn core(user_id: impl Into<UserId>) -> Self {
        SyncStreamId::Core {
            user_id: user_id.into(),
        }
    }

    /// Creates a calendar stream id.
    pub fn calendar(
        user_id: impl Into<UserId>,
        calendar_id: impl Into<CalendarId>,
        api_version: u32,
    ) -> Self {
        SyncStreamId::Calendar {
            user_id: user_id.into(),
            calendar_id: calendar_id.into(),
            api_version,
        }
    }

    /// Creates a drive stream id.
    pub fn drive(user_id: impl Into<UserId>, share_id: impl Into<ShareId>) -> Self {
        SyncStreamId::Drive {
            user_id: user_id.into(),
            share_id: share_id.into(),
        }
    }

    /// Returns the kind of this stream.
    pub fn kind(&self) -> StreamKind {
        match self {
            SyncStreamId::Core { .. } => StreamKind::Core,
            SyncStreamId::Calendar { .. } => StreamKind::Calendar,
            SyncStreamId::Drive { .. } => StreamKind::Drive,
        }
    }

    /// Returns the owning user.
    pub fn user_id(&self) -> &UserId {
        match self {
            SyncStreamId::Core { user_id }
            | SyncStreamId::Calendar { user_id, .. }
            | SyncStreamId::Drive { user_id, .. } => user_id,
        }
    }

    /// Returns the stable text form of this id.
    pub fn key(&self) -> String {
        match self {
            SyncStreamId::Core { user_id } => format!("core:{}", escape(user_id.as_str())),
            SyncStreamId::Calendar {
                user_id,
                calendar_id,
                api_version,
            } => format!(
                "calendar:{}:{}:{}",
                escape(user_id.as_str()),
                escape(calendar_id.as_str()),
                api_version
            ),
            SyncStreamId::Drive { user_id, share_id } => format!(
                "drive:{}:{}",
                escape(user_id.as_str()),
                escape(share_id.as_str())
            ),
        }
    }

    /// Returns the tag set used for bulk job lookup and cancellation:
    /// the key, the owning user id and the stream kind name. The user id and
    /// kind tags are not prefixed, so a user id may equal a kind name.
    pub fn tags(&self) -> [String; 3] {
        [
            self.key(),
            self.user_id().to_string(),
            self.kind().as_str().to_string(),
        ]
    }
}

impl fmt::Display for SyncStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for SyncStreamId {
    type Err = ProtocolError;

    fn from_str(input: &str) -> ProtocolResult<Self> {
        let parts: Vec<&str> = input.split(':').collect();
        let kind: StreamKind = parts[0]
            .parse()
            .map_err(|_| ProtocolError::invalid_stream_id(input, "unknown stream kind"))?;

        let expected = match kind {
            StreamKind::Core => 2,
            StreamKind::Calendar => 4,
            StreamKind::Drive => 3,
        };
        if parts.len() != expected {
            return Err(ProtocolError::invalid_stream_id(
                input,
                format!("expected {} components, got {}", expected, parts.len()),
            ));
        }

        let component =
            |i: usize| unescape(parts[i]).map_err(|r| ProtocolError::invalid_stream_id(input, r));

        let id = match kind {
            StreamKind::Core => SyncStreamId::core(component(1)?),
            StreamKind::Calendar => {
                let api_version = parts[3].parse::<u32>().map_err(|_| {
                    ProtocolError::invalid_stream_id(input, "api version is not a number")
                })?;
                SyncStreamId::calendar(component(1)?, component(2)?, api_version)
            }
            StreamKind::Drive => SyncStreamId::drive(component(1)?, component(2)?),
        };

        // Keys are durable: only the exact text `key()` produces is accepted.
        if id.key() != input {
            return Err(ProtocolError::invalid_stream_id(input, "key is not in canonical form"));
        }
        Ok(id)
    }
}

impl From<SyncStreamId> for String {
    fn from(id: SyncStreamId) -> Self {
        id.key()
    }
}

impl TryFrom<String> for SyncStreamId {
    type Error = ProtocolError;

    fn try_from(value: String) -> ProtocolResult<Self> {
        value.parse()
    }
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(component: &str) -> Result<String, String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let escaped = rest.get(pos + 1..pos + 3).ok_or("truncated escape")?;
        match escaped {
            "25" => out.push('%'),
            "3A" => out.push(':'),
            other => return Err(format!("unsupported escape %{}", other)),
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}
