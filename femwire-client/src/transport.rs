//! The seam between a session and whatever carries its messages.

use crate::error::ClientError;
use femwire_protocol::{Chunk, ChunkStream, Request, Response};

/// What came back for one request.
#[derive(Debug)]
pub enum Reply {
    /// A JSON envelope, success or error.
    Response(Response),
    /// A completed chunk stream.
    Stream(ChunkStream),
}

/// A blocking request/reply channel to one engine session.
///
/// Implementations perform exactly one round trip per call: write the
/// request, write `upload` followed by an end-of-stream marker when the
/// operation carries one, then read the reply to completion.
pub trait Transport: Send {
    fn round_trip(&mut self, request: &Request, upload: &[Chunk]) -> Result<Reply, ClientError>;

    /// Releases the underlying channel.
    fn close(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn round_trip(&mut self, request: &Request, upload: &[Chunk]) -> Result<Reply, ClientError> {
        (**self).round_trip(request, upload)
    }

    fn close(&mut self) -> Result<(), ClientError> {
        (**self).close()
    }
}
