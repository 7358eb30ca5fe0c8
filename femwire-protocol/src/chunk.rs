//! Typed chunk codec.
//!
//! Arrays move in ordered streams of bounded chunks. Each chunk carries its
//! element-type tag and declared payload length; the first chunk of an
//! upload also names the target object and its shape.
//!
//! Chunk descriptor, carried in the frame header extension:
//!
//! ```text
//! +------------+-----------+--------------+
//! | value_type | shape_tag | declared_len |
//! |   1 byte   |  1 byte   |   4 bytes    |
//! +------------+-----------+--------------+----------------------+
//! | [name_len 2 bytes | name | dims: 1 (vector) or 2 (matrix) u64] |
//! +-----------------------------------------------------------------+
//! ```
//!
//! Decoding concatenates payload bytes before reinterpreting them, so chunk
//! boundaries may fall anywhere, including inside an element.

use crate::dtype::{Array, ValueType};
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::MAX_CHUNK_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Longest target name a stream header can carry: the descriptor, name
/// included, must fit the `u16` header extension length.
pub const MAX_NAME_LEN: usize = u16::MAX as usize - DESCRIPTOR_MAX_FIXED;

/// Type, shape tag, declared length, name length and two dimensions.
const DESCRIPTOR_MAX_FIXED: usize = 1 + 1 + 4 + 2 + 16;

const SHAPE_NONE: u8 = 0;
const SHAPE_VECTOR: u8 = 1;
const SHAPE_MATRIX: u8 = 2;

/// Logical shape of an uploaded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Vector { len: u64 },
    Matrix { rows: u64, cols: u64 },
}

impl Shape {
    pub fn element_count(&self) -> u64 {
        match *self {
            Shape::Vector { len } => len,
            Shape::Matrix { rows, cols } => rows * cols,
        }
    }
}

/// Target description carried by the first chunk of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub name: String,
    pub shape: Shape,
}

/// One bounded piece of a typed array stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub value_type: ValueType,
    pub declared_len: u32,
    pub payload: Bytes,
    pub header: Option<StreamHeader>,
}

impl Chunk {
    pub fn new(value_type: ValueType, payload: Bytes) -> Self {
        Self {
            value_type,
            // oversized payloads are refused when framed
            declared_len: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            payload,
            header: None,
        }
    }

    pub fn with_header(mut self, header: StreamHeader) -> Self {
        self.header = Some(header);
        self
    }

    /// Wraps the chunk in a stream frame.
    pub fn to_frame(&self) -> Frame {
        let mut ext = BytesMut::with_capacity(6);
        ext.put_u8(self.value_type.code());
        match &self.header {
            None => {
                ext.put_u8(SHAPE_NONE);
                ext.put_u32(self.declared_len);
            }
            Some(header) => {
                let tag = match header.shape {
                    Shape::Vector { .. } => SHAPE_VECTOR,
                    Shape::Matrix { .. } => SHAPE_MATRIX,
                };
                ext.put_u8(tag);
                ext.put_u32(self.declared_len);
                // `encode` bounds the name length
                ext.put_u16(header.name.len() as u16);
                ext.put_slice(header.name.as_bytes());
                match header.shape {
                    Shape::Vector { len } => ext.put_u64(len),
                    Shape::Matrix { rows, cols } => {
                        ext.put_u64(rows);
                        ext.put_u64(cols);
                    }
                }
            }
        }
        Frame::stream(ext.freeze(), self.payload.clone())
    }

    /// Reads a chunk back from a stream frame.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let mut ext = frame.header_extension;
        if ext.remaining() < 6 {
            return Err(ProtocolError::InvalidStreamHeader("descriptor too short"));
        }
        let value_type = ValueType::from_code(ext.get_u8())?;
        let tag = ext.get_u8();
        let declared_len = ext.get_u32();

        let header = match tag {
            SHAPE_NONE => None,
            SHAPE_VECTOR | SHAPE_MATRIX => {
                if ext.remaining() < 2 {
                    return Err(ProtocolError::InvalidStreamHeader("missing name length"));
                }
                let name_len = ext.get_u16() as usize;
                let dims = if tag == SHAPE_VECTOR { 1 } else { 2 };
                if ext.remaining() < name_len + dims * 8 {
                    return Err(ProtocolError::InvalidStreamHeader("truncated descriptor"));
                }
                let name = std::str::from_utf8(&ext.split_to(name_len))
                    .map_err(|_| ProtocolError::InvalidUtf8)?
                    .to_string();
                let shape = if tag == SHAPE_VECTOR {
                    Shape::Vector { len: ext.get_u64() }
                } else {
                    let rows = ext.get_u64();
                    let cols = ext.get_u64();
                    Shape::Matrix { rows, cols }
                };
                Some(StreamHeader { name, shape })
            }
            _ => return Err(ProtocolError::InvalidStreamHeader("unknown shape tag")),
        };

        if declared_len as usize != frame.payload.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: declared_len,
                actual: frame.payload.len(),
            });
        }

        Ok(Self {
            value_type,
            declared_len,
            payload: frame.payload,
            header,
        })
    }
}

/// A source of chunks in emission order.
pub trait ChunkSource {
    /// Whether the remote side ever started the stream.
    fn is_active(&self) -> bool;

    /// Next chunk, or `None` once the stream has completed.
    fn next_chunk(&mut self) -> Result<Option<Chunk>, ProtocolError>;
}

/// A fully received stream.
#[derive(Debug, Clone)]
pub struct ChunkStream {
    active: bool,
    chunks: VecDeque<Chunk>,
}

impl ChunkStream {
    /// An active stream with no chunks yet.
    pub fn new() -> Self {
        Self {
            active: true,
            chunks: VecDeque::new(),
        }
    }

    /// A stream the remote side never started.
    pub fn inactive() -> Self {
        Self {
            active: false,
            chunks: VecDeque::new(),
        }
    }

    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self {
            active: true,
            chunks: chunks.into(),
        }
    }

    pub fn push(&mut self, chunk: Chunk) {
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total payload bytes still queued.
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(|c| c.payload.len()).sum()
    }

    /// Header of the first queued chunk, if any.
    pub fn header(&self) -> Option<&StreamHeader> {
        self.chunks.front().and_then(|c| c.header.as_ref())
    }

    /// Type tag of the first queued chunk.
    pub fn value_type(&self) -> ValueType {
        self.chunks
            .front()
            .map(|c| c.value_type)
            .unwrap_or(ValueType::Unknown)
    }
}

impl Default for ChunkStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkSource for ChunkStream {
    fn is_active(&self) -> bool {
        self.active
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, ProtocolError> {
        Ok(self.chunks.pop_front())
    }
}

/// Reassembles a typed array from a chunk stream.
///
/// `explicit` overrides the stream's own tag. A stream that never started
/// fails with [`ProtocolError::EmptyRecord`]; a started stream with no
/// chunks yields an empty array of the explicit type.
pub fn decode<S>(source: &mut S, explicit: Option<ValueType>) -> Result<Array, ProtocolError>
where
    S: ChunkSource + ?Sized,
{
    if !source.is_active() {
        return Err(ProtocolError::EmptyRecord);
    }

    let first = source.next_chunk()?;
    let value_type = match explicit.filter(|t| t.is_known()) {
        Some(value_type) => value_type,
        None => match &first {
            Some(chunk) if chunk.value_type.is_known() => chunk.value_type,
            _ => return Err(ProtocolError::UnknownType),
        },
    };

    let Some(first) = first else {
        return Array::empty(value_type);
    };

    let mut buf = BytesMut::from(&first.payload[..]);
    while let Some(chunk) = source.next_chunk()? {
        buf.extend_from_slice(&chunk.payload);
    }
    Array::from_bytes(value_type, &buf)
}

/// Reassembles an untyped byte stream (file transfers).
pub fn decode_bytes<S>(source: &mut S) -> Result<Bytes, ProtocolError>
where
    S: ChunkSource + ?Sized,
{
    if !source.is_active() {
        return Err(ProtocolError::EmptyRecord);
    }
    let mut buf = BytesMut::new();
    while let Some(chunk) = source.next_chunk()? {
        buf.extend_from_slice(&chunk.payload);
    }
    Ok(buf.freeze())
}

fn check_args(name: &str, chunk_size: usize) -> Result<(), ProtocolError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(ProtocolError::InvalidChunkSize {
            size: chunk_size,
            max: MAX_CHUNK_SIZE,
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ProtocolError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

fn split(
    name: &str,
    value_type: ValueType,
    shape: Shape,
    bytes: Bytes,
    chunk_size: usize,
) -> Vec<Chunk> {
    let header = StreamHeader {
        name: name.to_string(),
        shape,
    };
    if bytes.is_empty() {
        return vec![Chunk::new(value_type, bytes).with_header(header)];
    }

    let mut chunks = Vec::with_capacity(bytes.len().div_ceil(chunk_size));
    let mut header = Some(header);
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + chunk_size).min(bytes.len());
        let mut chunk = Chunk::new(value_type, bytes.slice(offset..end));
        if let Some(header) = header.take() {
            chunk = chunk.with_header(header);
        }
        chunks.push(chunk);
        offset = end;
    }
    chunks
}

/// Serializes an array into upload chunks of at most `chunk_size` bytes.
///
/// The first chunk names the target and its shape. An empty array still
/// produces one (empty) chunk so the target description reaches the engine.
pub fn encode(
    name: &str,
    array: &Array,
    shape: Shape,
    chunk_size: usize,
) -> Result<Vec<Chunk>, ProtocolError> {
    check_args(name, chunk_size)?;
    if shape.element_count() != array.len() as u64 {
        return Err(ProtocolError::ShapeMismatch {
            expected: shape.element_count(),
            actual: array.len(),
        });
    }
    Ok(split(
        name,
        array.value_type(),
        shape,
        array.to_bytes(),
        chunk_size,
    ))
}

/// Cuts raw bytes into untyped chunks (file transfers).
pub fn encode_bytes(name: &str, data: Bytes, chunk_size: usize) -> Result<Vec<Chunk>, ProtocolError> {
    check_args(name, chunk_size)?;
    let shape = Shape::Vector {
        len: data.len() as u64,
    };
    Ok(split(name, ValueType::Unknown, shape, data, chunk_size))
}
