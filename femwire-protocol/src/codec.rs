//! Encoder and decoder for frames, messages and chunk streams.

use crate::chunk::Chunk;
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameKind};
use crate::message::{Request, Response};
use bytes::{Bytes, BytesMut};

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub enum Inbound {
    Request(Request),
    Response(Response),
    Chunk(Chunk),
    EndOfStream,
}

/// Encodes requests, responses and chunks into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request into a frame.
    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::from_json(request)?;
        frame.encode()
    }

    /// Encodes a response into a frame.
    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::from_json(response)?;
        frame.encode()
    }

    /// Encodes one chunk into a stream frame.
    pub fn encode_chunk(chunk: &Chunk) -> Result<BytesMut, ProtocolError> {
        chunk.to_frame().encode()
    }

    /// Encodes a whole stream, terminator included.
    pub fn encode_stream(chunks: &[Chunk]) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        for chunk in chunks {
            buf.extend_from_slice(&Self::encode_chunk(chunk)?);
        }
        buf.extend_from_slice(&Self::encode_end_of_stream()?);
        Ok(buf)
    }

    /// Encodes the frame that closes a stream.
    pub fn encode_end_of_stream() -> Result<BytesMut, ProtocolError> {
        Frame::end_of_stream().encode()
    }
}

/// Decodes frames into messages.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message of any kind.
    ///
    /// JSON envelopes are told apart by their `type` field.
    pub fn decode_message(&mut self) -> Result<Option<Inbound>, ProtocolError> {
        let Some(frame) = self.decode_frame()? else {
            return Ok(None);
        };

        match frame.kind() {
            FrameKind::EndOfStream => return Ok(Some(Inbound::EndOfStream)),
            FrameKind::Chunk => return Ok(Some(Inbound::Chunk(Chunk::from_frame(frame)?))),
            FrameKind::Envelope => {}
        }

        let payload = std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        let value: serde_json::Value = serde_json::from_str(payload)?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("request") => Ok(Some(Inbound::Request(serde_json::from_value(value)?))),
            Some("response") => Ok(Some(Inbound::Response(serde_json::from_value(value)?))),
            _ => Err(ProtocolError::MissingField("type")),
        }
    }

    /// Attempts to decode the next request from the buffer.
    pub fn decode_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => {
                let payload =
                    std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
                let request: Request = serde_json::from_str(payload)?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    /// Attempts to decode the next response from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => {
                let payload =
                    std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
                let response: Response = serde_json::from_str(payload)?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
