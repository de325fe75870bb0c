//! Error taxonomy for the hub.
//!
//! Nothing here is fatal to the runtime: codec and registry errors are
//! recovered per frame, handler errors per invocation, and transport
//! errors per connection.

use crate::runtime::ConnectionId;

/// Errors produced by the hub core.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("{count} arguments exceed the limit of {limit}")]
    TooManyArguments { count: usize, limit: usize },

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("method '{0}' not found")]
    MethodNotFound(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("handler for '{method}' failed: {reason}")]
    HandlerFailure { method: String, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection limit of {0} reached")]
    CapacityExceeded(usize),

    #[error("method '{0}' registered twice")]
    DuplicateMethod(String),

    #[error("connection {0} is not draining its send queue")]
    SlowConsumer(ConnectionId),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::ParseError(e.to_string())
    }
}

/// Errors a registered handler can fail with.
///
/// The dispatcher wraps these into [`HubError::HandlerFailure`] and, when the
/// caller asked for a completion, reports the display text back to it.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Shorthand for a free-form failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

pub type Result<T, E = HubError> = std::result::Result<T, E>;
