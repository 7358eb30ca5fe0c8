//! Protocol error types and error codes.

use crate::dtype::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors raised while framing, encoding or decoding streams.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'FEMW', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("Empty Record")]
    EmptyRecord,

    #[error("unable to determine the element type of the stream")]
    UnknownType,

    #[error("unknown element type code: {0}")]
    UnknownValueType(u8),

    #[error("stream of {len} bytes does not hold whole {value_type} elements")]
    TruncatedElement { len: usize, value_type: ValueType },

    #[error("chunk size must be between 1 and {max} bytes, got {size}")]
    InvalidChunkSize { size: usize, max: usize },

    #[error("target name of {len} bytes exceeds {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("chunk declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("shape holds {expected} elements but the array has {actual}")]
    ShapeMismatch { expected: u64, actual: usize },

    #[error("malformed stream header: {0}")]
    InvalidStreamHeader(&'static str),
}

/// Stable error codes returned in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    BadRequest,

    // Workspace errors
    NotFound,
    InvalidCommand,
    ShapeMismatch,
    Unsupported,
    SingularMatrix,

    // System errors
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::UnsupportedProtocol => write!(f, "UNSUPPORTED_PROTOCOL"),
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
            ErrorCode::NotFound => write!(f, "NOT_FOUND"),
            ErrorCode::InvalidCommand => write!(f, "INVALID_COMMAND"),
            ErrorCode::ShapeMismatch => write!(f, "SHAPE_MISMATCH"),
            ErrorCode::Unsupported => write!(f, "UNSUPPORTED"),
            ErrorCode::SingularMatrix => write!(f, "SINGULAR_MATRIX"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}
