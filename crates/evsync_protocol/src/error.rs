//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or parsing protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a message to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A serialized stream id could not be parsed.
    #[error("invalid stream id {input:?}: {reason}")]
    InvalidStreamId {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Unknown stream kind name.
    #[error("unknown stream kind: {0}")]
    UnknownStreamKind(String),

    /// Unknown numeric action code.
    #[error("unknown action code: {0}")]
    UnknownAction(u8),
}

impl ProtocolError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid stream id error.
    pub fn invalid_stream_id(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStreamId {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
