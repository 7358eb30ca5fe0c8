//! Engine error types.

use femwire_protocol::ErrorCode;
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] femwire_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u16),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("matrix {0} is singular")]
    SingularMatrix(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl SimError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SimError::Io(_) => ErrorCode::InternalError,
            SimError::Protocol(_) => ErrorCode::BadRequest,
            SimError::Json(_) => ErrorCode::BadRequest,
            SimError::InvalidRequest(_) => ErrorCode::BadRequest,
            SimError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            SimError::NotFound(_) => ErrorCode::NotFound,
            SimError::InvalidCommand(_) => ErrorCode::InvalidCommand,
            SimError::ShapeMismatch(_) => ErrorCode::ShapeMismatch,
            SimError::Unsupported(_) => ErrorCode::Unsupported,
            SimError::SingularMatrix(_) => ErrorCode::SingularMatrix,
            SimError::ShuttingDown => ErrorCode::InternalError,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        SimError::InvalidCommand(message.into())
    }
}
