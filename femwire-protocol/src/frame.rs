//! Binary frame format.
//!
//! ```text
//! magic "FEMW" | version u16 | flags u16 | header_len u16 | payload_len u32 | crc32c u32
//! [header_ext: header_len bytes] [payload: payload_len bytes]
//! ```
//!
//! Header fields are big-endian and the CRC covers the payload only. JSON
//! envelopes travel in plain frames. Array chunks travel in `STREAM` frames
//! whose header extension describes the chunk (see [`crate::chunk`]), and an
//! empty `STREAM | END_STREAM` frame closes the stream.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying femwire frames.
pub const MAGIC: [u8; 4] = *b"FEMW";

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 18;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// Reserved.
    pub const COMPRESSED: u16 = 1 << 1;
    pub const STREAM: u16 = 1 << 2;
    pub const END_STREAM: u16 = 1 << 3;

    const KNOWN: u16 = Self::CRC_PRESENT | Self::COMPRESSED | Self::STREAM | Self::END_STREAM;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(self) -> Self {
        Self(self.0 | Self::CRC_PRESENT)
    }

    pub fn with_stream(self) -> Self {
        Self(self.0 | Self::STREAM)
    }

    pub fn with_end_stream(self) -> Self {
        Self(self.0 | Self::STREAM | Self::END_STREAM)
    }

    fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn has_crc(&self) -> bool {
        self.has(Self::CRC_PRESENT)
    }

    pub fn is_compressed(&self) -> bool {
        self.has(Self::COMPRESSED)
    }

    pub fn is_stream(&self) -> bool {
        self.has(Self::STREAM)
    }

    pub fn is_end_stream(&self) -> bool {
        self.has(Self::END_STREAM)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Parses flags; unknown bits and `END_STREAM` without `STREAM` are rejected.
    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        let end_without_stream = bits & Self::END_STREAM != 0 && bits & Self::STREAM == 0;
        if bits & !Self::KNOWN != 0 || end_without_stream {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// What a frame carries, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A JSON request or response.
    Envelope,
    /// One chunk of a typed array stream.
    Chunk,
    /// The marker closing a stream.
    EndOfStream,
}

/// The fixed-size part of a frame, read without consuming the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub flags: FrameFlags,
    pub header_len: usize,
    pub payload_len: usize,
    pub crc: u32,
}

impl FrameHeader {
    /// Reads the header at the start of `buf`, or `None` if fewer than
    /// [`FRAME_HEADER_SIZE`] bytes are buffered.
    pub fn peek(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut cursor = &buf[..FRAME_HEADER_SIZE];

        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = cursor.get_u16();
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(cursor.get_u16())?;
        let header_len = cursor.get_u16() as usize;
        let payload_len = cursor.get_u32();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let crc = cursor.get_u32();

        Ok(Some(Self {
            version,
            flags,
            header_len,
            payload_len: payload_len as usize,
            crc,
        }))
    }

    /// Size of the whole frame on the wire.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.header_len + self.payload_len
    }
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    /// Chunk descriptor on stream frames; empty otherwise.
    pub header_extension: Bytes,
    pub payload: Bytes,
}

impl Frame {
    fn with_flags(flags: FrameFlags, header_extension: Bytes, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: flags.with_crc(),
            header_extension,
            payload,
        }
    }

    /// Creates a plain frame with the given payload.
    pub fn new(payload: Bytes) -> Self {
        Self::with_flags(FrameFlags::new(), Bytes::new(), payload)
    }

    /// Creates a plain frame holding a JSON envelope.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(payload)))
    }

    /// Creates a stream frame carrying one chunk.
    pub fn stream(header_extension: Bytes, payload: Bytes) -> Self {
        Self::with_flags(FrameFlags::new().with_stream(), header_extension, payload)
    }

    /// Creates the empty frame that closes a stream.
    pub fn end_of_stream() -> Self {
        Self::with_flags(FrameFlags::new().with_end_stream(), Bytes::new(), Bytes::new())
    }

    pub fn kind(&self) -> FrameKind {
        if self.flags.is_end_stream() {
            FrameKind::EndOfStream
        } else if self.flags.is_stream() {
            FrameKind::Chunk
        } else {
            FrameKind::Envelope
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header_len = u16::try_from(self.header_extension.len())
            .map_err(|_| ProtocolError::InvalidStreamHeader("header extension too long"))?;

        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };

        let mut buf = BytesMut::with_capacity(
            FRAME_HEADER_SIZE + self.header_extension.len() + self.payload.len(),
        );
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u16(header_len);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(crc);
        buf.put_slice(&self.header_extension);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves the buffer untouched while the frame is
    /// still incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(header) = FrameHeader::peek(&buf[..])? else {
            return Ok(None);
        };
        let frame_len = header.frame_len();
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let header_extension = buf.split_to(header.header_len).freeze();
        let payload = buf.split_to(header.payload_len).freeze();

        if header.flags.has_crc() {
            let actual = crc32c::crc32c(&payload);
            if actual != header.crc {
                return Err(ProtocolError::CrcMismatch {
                    expected: header.crc,
                    actual,
                });
            }
        }

        Ok(Some(Self {
            version: header.version,
            flags: header.flags,
            header_extension,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(magic: &[u8; 4], version: u16, flags: u16, payload_len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(magic);
        buf.put_u16(version);
        buf.put_u16(flags);
        buf.put_u16(0);
        buf.put_u32(payload_len);
        buf.put_u32(0);
        buf
    }

    #[test]
    fn test_envelope_frame() {
        let payload = Bytes::from(r#"{"type":"request","id":"1","op":"PING","params":{}}"#);
        let mut buf = Frame::new(payload.clone()).encode().unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + payload.len());

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind(), FrameKind::Envelope);
        assert!(decoded.flags.has_crc());
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_chunk_frame_keeps_extension() {
        let frame = Frame::stream(Bytes::from_static(b"ext"), Bytes::from_static(&[1, 2, 3]));
        let mut buf = frame.encode().unwrap();

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind(), FrameKind::Chunk);
        assert_eq!(decoded.header_extension.as_ref(), b"ext");
        assert_eq!(decoded.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_end_of_stream_is_header_only() {
        let mut buf = Frame::end_of_stream().encode().unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind(), FrameKind::EndOfStream);
    }

    #[test]
    fn test_corrupted_payload_fails_crc() {
        let mut buf = Frame::stream(Bytes::new(), Bytes::from_static(&[9; 16]))
            .encode()
            .unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_crc_can_be_omitted() {
        let mut frame = Frame::new(Bytes::from_static(b"{}"));
        frame.flags = FrameFlags::new();
        let mut buf = frame.encode().unwrap();
        buf[FRAME_HEADER_SIZE] = b'['; // not checked

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.has_crc());
        assert_eq!(decoded.payload.as_ref(), b"[}");
    }

    #[test]
    fn test_header_errors() {
        let mut bad_magic = header_bytes(b"BADX", crate::PROTOCOL_VERSION, 0, 0);
        assert!(matches!(
            Frame::decode(&mut bad_magic),
            Err(ProtocolError::InvalidMagic(_))
        ));

        let mut bad_version = header_bytes(&MAGIC, 99, 0, 0);
        assert!(matches!(
            Frame::decode(&mut bad_version),
            Err(ProtocolError::UnsupportedVersion(99))
        ));

        let mut oversized = header_bytes(&MAGIC, crate::PROTOCOL_VERSION, 0, MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(
            Frame::decode(&mut oversized),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_flag_validation() {
        assert!(matches!(
            FrameFlags::from_bits(0x0100),
            Err(ProtocolError::InvalidFlags(0x0100))
        ));
        assert!(matches!(
            FrameFlags::from_bits(FrameFlags::END_STREAM),
            Err(ProtocolError::InvalidFlags(_))
        ));
        let flags = FrameFlags::from_bits(FrameFlags::STREAM | FrameFlags::END_STREAM).unwrap();
        assert!(flags.is_end_stream());
    }

    #[test]
    fn test_oversized_payload_not_encoded() {
        let frame = Frame::new(Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE as usize + 1]));
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let encoded = Frame::stream(Bytes::from_static(b"xy"), Bytes::from_static(&[7; 32]))
            .encode()
            .unwrap();

        let mut buf = BytesMut::from(&encoded[..10]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[10..encoded.len() - 1]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[encoded.len() - 1..]);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 32);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::new(Bytes::from_static(b"{}")).encode().unwrap());
        buf.extend_from_slice(&Frame::stream(Bytes::new(), Bytes::from_static(&[1])).encode().unwrap());
        buf.extend_from_slice(&Frame::end_of_stream().encode().unwrap());

        let kinds: Vec<FrameKind> = std::iter::from_fn(|| Frame::decode(&mut buf).unwrap())
            .map(|f| f.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![FrameKind::Envelope, FrameKind::Chunk, FrameKind::EndOfStream]
        );
    }
}
