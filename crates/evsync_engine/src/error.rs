//! Error types for the sync engine.

use evsync_protocol::{Action, ProtocolError, StreamKind};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Remote call did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The server answered with an application error.
    #[error("api error (status {status}, code {code}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Application error code.
        code: u32,
        /// Server message.
        message: String,
    },

    /// The stored checkpoint is no longer known to the server.
    #[error("checkpoint is no longer valid")]
    CheckpointInvalid,

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A listener callback failed.
    #[error("listener {listener} failed during {action:?}: {message}")]
    Listener {
        /// Listener name.
        listener: String,
        /// Action being applied, if any.
        action: Option<Action>,
        /// Error message.
        message: String,
    },

    /// A listener could not deserialize its events.
    #[error("listener {listener} could not deserialize events: {message}")]
    Deserialize {
        /// Listener name.
        listener: String,
        /// Error message.
        message: String,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(String),

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// `process()` was called for a stream kind no listener is registered for.
    #[error("no listener registered for stream kind {0}")]
    UnregisteredStreamKind(StreamKind),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a listener error.
    pub fn listener(
        listener: impl Into<String>,
        action: Option<Action>,
        message: impl Into<String>,
    ) -> Self {
        Self::Listener {
            listener: listener.into(),
            action,
            message: message.into(),
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Returns true if this error can be retried.
    ///
    /// Checkpoint invalidation is not retryable by itself: it is handled by
    /// the reset path before anything is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout
            | SyncError::NotConnected
            | SyncError::Api { .. }
            | SyncError::Listener { .. }
            | SyncError::Deserialize { .. }
            | SyncError::Store(_)
            | SyncError::Protocol(_) => true,
            SyncError::CheckpointInvalid
            | SyncError::Cancelled
            | SyncError::UnregisteredStreamKind(_) => false,
        }
    }

    /// Returns true if this error marks a cancelled run.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Returns true if the server rejected the checkpoint.
    pub fn is_checkpoint_invalid(&self) -> bool {
        matches!(self, SyncError::CheckpointInvalid)
    }

    /// Returns true for programming contract violations.
    pub fn is_defect(&self) -> bool {
        matches!(self, SyncError::UnregisteredStreamKind(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Api {
            status: 500,
            code: 0,
            message: "internal".into()
        }
        .is_retryable());
        assert!(SyncError::listener("labels", Some(Action::Create), "boom").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::CheckpointInvalid.is_retryable());
    }

    #[test]
    fn classification() {
        assert!(SyncError::Cancelled.is_cancelled());
        assert!(SyncError::CheckpointInvalid.is_checkpoint_invalid());
        assert!(SyncError::UnregisteredStreamKind(StreamKind::Drive).is_defect());
        assert!(!SyncError::Timeout.is_defect());
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotConnected;
        assert_eq!(err.to_string(), "not connected to server");

        let err = SyncError::listener("labels", Some(Action::Delete), "constraint");
        let msg = err.to_string();
        assert!(msg.contains("labels"));
        assert!(msg.contains("Delete"));
        assert!(msg.contains("constraint"));
    }
}
