//! In-process transport: drives a [`CommandHandler`] directly, without TCP.

use crate::config::EngineConfig;
use crate::handler::{CommandHandler, Outcome};
use crate::session::Session as EngineSession;
use femwire_client::{ClientConfig, ClientError, Reply, Session, Transport};
use femwire_protocol::message::{HelloParams, Operation};
use femwire_protocol::{Chunk, ChunkStream, Request, PROTOCOL_VERSION};

/// A [`Transport`] backed by an engine session living in the same process.
pub struct LocalTransport {
    handler: CommandHandler,
    session: EngineSession,
}

impl LocalTransport {
    /// Creates an engine session and completes the HELLO handshake with it.
    pub fn new(config: &EngineConfig) -> Result<Self, ClientError> {
        let mut transport = Self {
            handler: CommandHandler::default(),
            session: EngineSession::new("local", config),
        };
        let hello = HelloParams {
            protocol_version: PROTOCOL_VERSION,
            client_name: Some("local".to_string()),
        };
        let request = Request::new("0", Operation::Hello).with_params(serde_json::to_value(hello)?);
        match transport.round_trip(&request, &[])? {
            Reply::Response(response) => {
                if let Some(err) = response.error {
                    return Err(ClientError::Engine {
                        code: err.code,
                        message: err.message,
                    });
                }
            }
            Reply::Stream(_) => {
                return Err(ClientError::UnexpectedReply(
                    "stream in reply to HELLO".to_string(),
                ))
            }
        }
        Ok(transport)
    }

    /// The engine session behind this transport.
    pub fn engine_session(&self) -> &EngineSession {
        &self.session
    }
}

impl Transport for LocalTransport {
    fn round_trip(&mut self, request: &Request, upload: &[Chunk]) -> Result<Reply, ClientError> {
        match self.handler.handle(&mut self.session, request, upload.to_vec()) {
            Outcome::Response(response) => Ok(Reply::Response(response)),
            Outcome::Stream(chunks) => Ok(Reply::Stream(ChunkStream::from_chunks(chunks))),
        }
    }
}

/// Opens a client session against a fresh in-process engine.
pub fn local_session(engine: &EngineConfig, client: &ClientConfig) -> Result<Session, ClientError> {
    let transport = LocalTransport::new(engine)?;
    Session::with_transport(transport, client)
}
