//! Error types for session negotiation and signaling

use thiserror::Error;

/// Result type for session-core operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by the SDP, engine, transport and channel layers
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// A required argument was missing or malformed
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Operation not allowed in the current session state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Offer/answer creation or description-set failure
    #[error("Negotiation failed: {message}")]
    Negotiation { message: String },

    /// Engine-reported failure (ICE failure, unexpected close)
    #[error("Media engine error: {message}")]
    Engine { message: String },

    /// Signaling send failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The server acknowledged a request with an error status
    #[error("Server rejected request '{event}': {message}")]
    ServerRejected { event: String, message: String },

    /// No acknowledgement arrived in time
    #[error("Operation '{operation}' timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// The signaling connection is gone for good
    #[error("Signaling server disconnected: {reason}")]
    Disconnected { reason: String },

    /// Login token or reconnection ticket could not be decoded
    #[error("Invalid token: {message}")]
    InvalidToken { message: String },

    /// Remote peer is not in the allowed list
    #[error("Remote peer '{remote_id}' is not allowed")]
    RemoteNotAllowed { remote_id: String },

    /// Remote peer cannot be reached by the signaling server
    #[error("Remote peer '{remote_id}' is unreachable")]
    TargetUnreachable { remote_id: String },

    /// Remote side lacks a capability required by the request
    #[error("Not supported: {feature}")]
    NotSupported { feature: String },

    /// Wire payload failed to (de)serialize
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse error classes used for logging and policy decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Argument,
    Negotiation,
    Transport,
    Engine,
    Internal,
}

impl SessionError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    pub fn negotiation(message: impl Into<String>) -> Self {
        Self::Negotiation { message: message.into() }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine { message: message.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn server_rejected(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServerRejected {
            event: event.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected { reason: reason.into() }
    }

    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken { message: message.into() }
    }

    pub fn not_supported(feature: impl Into<String>) -> Self {
        Self::NotSupported { feature: feature.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Classify the error following the negotiation/transport/engine taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidArgument { .. }
            | Self::InvalidState { .. }
            | Self::RemoteNotAllowed { .. }
            | Self::NotSupported { .. }
            | Self::InvalidToken { .. } => ErrorCategory::Argument,
            Self::Negotiation { .. } => ErrorCategory::Negotiation,
            Self::Transport { .. }
            | Self::ServerRejected { .. }
            | Self::Timeout { .. }
            | Self::Disconnected { .. }
            | Self::TargetUnreachable { .. } => ErrorCategory::Transport,
            Self::Engine { .. } => ErrorCategory::Engine,
            Self::Serialization { .. } | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the same request could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            SessionError::invalid_argument("stream").category(),
            ErrorCategory::Argument
        );
        assert_eq!(
            SessionError::negotiation("offer").category(),
            ErrorCategory::Negotiation
        );
        assert_eq!(
            SessionError::timeout("publish", 100).category(),
            ErrorCategory::Transport
        );
        assert!(SessionError::transport("socket closed").is_recoverable());
        assert!(!SessionError::disconnected("drop").is_recoverable());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: SessionError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, SessionError::Serialization { .. }));
    }
}
