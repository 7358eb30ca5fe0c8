//! # femwire-protocol
//!
//! Wire protocol shared by the femwire client and the reference engine.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - The typed chunk codec used for every array transfer
//! - Local typed arrays and the element-type table
//! - JSON request/response envelopes and operation parameters

pub mod chunk;
pub mod codec;
pub mod dtype;
pub mod error;
pub mod frame;
pub mod message;

pub use chunk::{
    decode, decode_bytes, encode, encode_bytes, Chunk, ChunkSource, ChunkStream, Shape,
    StreamHeader,
};
pub use codec::{Decoder, Encoder, Inbound};
pub use dtype::{Array, Complex, Element, ValueType};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FrameHeader, FrameKind, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Operation, Request, Response, ResponseError, ResponseStatus};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the reference engine.
pub const DEFAULT_PORT: u16 = 50052;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Default chunk size for array streams (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Default chunk size for file transfers (1 MiB).
pub const DEFAULT_FILE_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk the engine accepts (4 MiB).
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;
