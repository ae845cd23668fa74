//! Error types for the client façades
//!
//! [`ClientError`] wraps every [`SessionError`] coming up from the channel
//! layer and adds the failures that only make sense at the client level:
//! calls made before connecting, remote ids outside the allowed list, and
//! operations the caller gave up waiting for.

use rtcsig_session_core::{ErrorCategory, SessionError};
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid configuration for {field}: {reason}")]
    Configuration { field: String, reason: String },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("Not connected to a signaling server")]
    NotConnected,

    #[error("Remote {remote_id} is not in the allowed list")]
    NotAllowed { remote_id: String },

    #[error("Stream {stream_id} is not known in this conference")]
    StreamNotFound { stream_id: String },

    #[error("Operation timed out after {duration_ms}ms")]
    OperationTimeout { duration_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ClientError {
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub fn not_allowed(remote_id: impl Into<String>) -> Self {
        Self::NotAllowed {
            remote_id: remote_id.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether repeating the operation could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::Session(e) => e.is_recoverable(),
            ClientError::OperationTimeout { .. } => true,
            _ => false,
        }
    }

    /// Short label used in logs
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::Session(e) => match e.category() {
                ErrorCategory::Argument => "argument",
                ErrorCategory::Negotiation => "negotiation",
                ErrorCategory::Transport => "transport",
                ErrorCategory::Engine => "engine",
                ErrorCategory::Internal => "internal",
            },
            ClientError::Configuration { .. } => "configuration",
            ClientError::InvalidState { .. } | ClientError::StreamNotFound { .. } => "state",
            ClientError::NotConnected => "connection",
            ClientError::NotAllowed { .. } => "permission",
            ClientError::OperationTimeout { .. } => "timeout",
            ClientError::Internal { .. } => "internal",
        }
    }

    /// The wrapped session error, if this came from the channel layer
    pub fn as_session(&self) -> Option<&SessionError> {
        match self {
            ClientError::Session(e) => Some(e),
            _ => None,
        }
    }
}
