//! Client error types.

use femwire_protocol::{ErrorCode, ValueType};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] femwire_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    /// The session lost its transport; every later call fails the same way.
    #[error("session terminated: {0}")]
    SessionTerminated(String),

    #[error("engine error: {code} - {message}")]
    Engine { code: ErrorCode, message: String },

    #[error("interrupted")]
    Interrupted,

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unsupported element type: {0}")]
    UnsupportedType(ValueType),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("element types differ: {left} and {right}")]
    TypeMismatch { left: ValueType, right: ValueType },

    #[error("matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: u64, cols: u64 },

    #[error("division by zero")]
    ZeroDivisor,

    #[error("workspace names exhausted for prefix {0}")]
    NamesExhausted(String),

    #[error("file not found in engine working directory: {0}")]
    FileNotFound(String),

    #[error("malformed mesh data: {0}")]
    MalformedMesh(String),

    #[error("worker thread panicked fetching {0}")]
    WorkerPanicked(&'static str),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ClientError {
    /// Returns whether the session is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::SessionTerminated(_))
    }

    /// Returns whether this error was raised locally before any remote call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidName { .. }
                | ClientError::InvalidCommand(_)
                | ClientError::UnsupportedType(_)
                | ClientError::ShapeMismatch(_)
                | ClientError::TypeMismatch { .. }
                | ClientError::NotSquare { .. }
                | ClientError::ZeroDivisor
        )
    }
}
