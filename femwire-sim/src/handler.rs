//! Command handlers.

use crate::error::SimError;
use crate::session::{Session, SessionState};
use femwire_protocol::message::*;
use femwire_protocol::{
    decode, decode_bytes, encode, encode_bytes, Array, Chunk, ChunkStream, Shape,
    PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Engine identity reported in the handshake.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "femwire-sim".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What to write back for one request.
#[derive(Debug)]
pub enum Outcome {
    /// A JSON envelope.
    Response(Response),
    /// Chunk frames followed by an end-of-stream marker.
    Stream(Vec<Chunk>),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        match self {
            Outcome::Response(r) => r.is_ok(),
            Outcome::Stream(_) => true,
        }
    }
}

/// Result of one handler before it is addressed to a request id.
enum Handled {
    Value(Value),
    Chunks(Vec<Chunk>),
}

/// Command handler.
#[derive(Debug, Default)]
pub struct CommandHandler {
    info: ServerInfo,
}

impl CommandHandler {
    pub fn new(info: ServerInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Handles a request. `upload` holds the chunks that followed the
    /// request frame, if its operation carries any.
    pub fn handle(&self, session: &mut Session, request: &Request, upload: Vec<Chunk>) -> Outcome {
        session.record_request();

        if session.state() == SessionState::Connected
            && !matches!(request.op, Operation::Hello | Operation::Ping)
        {
            return Self::error(
                request,
                SimError::InvalidRequest("handshake required".to_string()),
            );
        }

        let result = match request.op {
            Operation::Hello => self.handle_hello(session, &request.params).map(Handled::Value),
            Operation::Ping => Ok(Handled::Value(json!({}))),
            Operation::Exit => {
                session.set_state(SessionState::Closing);
                Ok(Handled::Value(json!({})))
            }
            Operation::Run => self.handle_run(session, &request.params).map(Handled::Value),
            Operation::GetParameter => {
                self.handle_get_parameter(session, &request.params).map(Handled::Value)
            }
            Operation::Get => self.handle_get(session, &request.params).map(Handled::Value),
            Operation::DataInfo => self.handle_data_info(session, &request.params).map(Handled::Value),
            Operation::GetVecData => self.handle_get_vec_data(session, &request.params),
            Operation::GetMatData => self.handle_get_mat_data(session, &request.params),
            Operation::SetVecData | Operation::SetMatData => self
                .handle_set_data(session, request.op, upload)
                .map(Handled::Value),
            Operation::Vget => self.handle_vget(session, &request.params),
            Operation::Nodes => {
                let array = session.engine().nodes();
                Self::stream_array("NODES", array, &request.params)
            }
            Operation::LoadElements => {
                let array = session.engine().elements();
                Self::stream_array("ELEMENTS", array, &request.params)
            }
            Operation::LoadElementTypes => {
                let array = session.engine().element_types();
                Self::stream_array("ETYPES", array, &request.params)
            }
            Operation::UploadFile => self
                .handle_upload_file(session, &request.params, upload)
                .map(Handled::Value),
            Operation::DownloadFile => self.handle_download_file(session, &request.params),
            Operation::ListFiles => serde_json::to_value(ListFilesResult {
                files: session.engine().list_files(),
            })
            .map(Handled::Value)
            .map_err(SimError::from),
        };

        match result {
            Ok(Handled::Value(value)) => Outcome::Response(Response::ok(&request.id, value)),
            Ok(Handled::Chunks(chunks)) => Outcome::Stream(chunks),
            Err(e) => Self::error(request, e),
        }
    }

    fn error(request: &Request, e: SimError) -> Outcome {
        tracing::debug!("Request id={} op={:?} failed: {}", request.id, request.op, e);
        Outcome::Response(Response::error(
            &request.id,
            ResponseError::new(e.error_code(), e.to_string()),
        ))
    }

    fn params<T: DeserializeOwned>(params: &Value) -> Result<T, SimError> {
        serde_json::from_value(params.clone()).map_err(|e| SimError::InvalidRequest(e.to_string()))
    }

    fn handle_hello(&self, session: &mut Session, params: &Value) -> Result<Value, SimError> {
        let hello: HelloParams = Self::params(params)?;
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(SimError::UnsupportedProtocol(hello.protocol_version));
        }
        session.complete_handshake(hello.protocol_version, hello.client_name);
        tracing::info!(
            "[{}] Session {} ready (client {})",
            session.peer,
            session.id,
            session.client_name().unwrap_or("unnamed")
        );

        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
            session_id: session.id.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn handle_run(&self, session: &mut Session, params: &Value) -> Result<Value, SimError> {
        let run: RunParams = Self::params(params)?;
        let output = session.engine_mut().run(&run.command)?;
        Ok(serde_json::to_value(RunResult { output })?)
    }

    fn handle_get_parameter(&self, session: &Session, params: &Value) -> Result<Value, SimError> {
        let p: GetParameterParams = Self::params(params)?;
        let value = session.engine().parameter(&p.name);
        Ok(serde_json::to_value(ScalarResult { value })?)
    }

    fn handle_get(&self, session: &Session, params: &Value) -> Result<Value, SimError> {
        let p: GetParams = Self::params(params)?;
        let value = session.engine().get(&p)?;
        Ok(serde_json::to_value(ScalarResult { value })?)
    }

    fn handle_data_info(&self, session: &Session, params: &Value) -> Result<Value, SimError> {
        let p: NameParams = Self::params(params)?;
        Ok(serde_json::to_value(session.engine().data_info(&p.name)?)?)
    }

    fn handle_get_vec_data(&self, session: &Session, params: &Value) -> Result<Handled, SimError> {
        let p: StreamParams = Self::params(params)?;
        let array = session.engine().vec_data(&p.name)?;
        let shape = Shape::Vector {
            len: array.len() as u64,
        };
        Ok(Handled::Chunks(encode(&p.name, &array, shape, p.chunk_size)?))
    }

    fn handle_get_mat_data(&self, session: &Session, params: &Value) -> Result<Handled, SimError> {
        let p: StreamParams = Self::params(params)?;
        let info = session.engine().data_info(&p.name)?;
        let array = session.engine().mat_data(&p.name)?;
        let shape = Shape::Matrix {
            rows: info.size1,
            cols: info.size2,
        };
        Ok(Handled::Chunks(encode(&p.name, &array, shape, p.chunk_size)?))
    }

    fn handle_set_data(
        &self,
        session: &mut Session,
        op: Operation,
        upload: Vec<Chunk>,
    ) -> Result<Value, SimError> {
        let mut stream = ChunkStream::from_chunks(upload);
        let header = stream
            .header()
            .cloned()
            .ok_or_else(|| SimError::InvalidRequest("upload without a stream header".to_string()))?;
        match (op, header.shape) {
            (Operation::SetVecData, Shape::Vector { .. })
            | (Operation::SetMatData, Shape::Matrix { .. }) => {}
            (_, shape) => {
                return Err(SimError::InvalidRequest(format!(
                    "{:?} cannot store shape {:?}",
                    op, shape
                )))
            }
        }
        let array = decode(&mut stream, None)?;
        tracing::debug!(
            "[{}] Upload to {}: {} {} values",
            session.peer,
            header.name,
            array.len(),
            array.value_type()
        );
        let shape = session
            .engine_mut()
            .set_data(&header.name, array, header.shape)?;
        Ok(serde_json::to_value(SetDataResult {
            name: header.name.to_ascii_uppercase(),
            shape,
        })?)
    }

    fn handle_vget(&self, session: &Session, params: &Value) -> Result<Handled, SimError> {
        let p: VgetParams = Self::params(params)?;
        let array = session.engine().vget(&p)?;
        let shape = Shape::Vector {
            len: array.len() as u64,
        };
        Ok(Handled::Chunks(encode("VGET", &array, shape, p.chunk_size)?))
    }

    fn stream_array(name: &str, array: Array, params: &Value) -> Result<Handled, SimError> {
        let p: StreamRequest = Self::params(params)?;
        let shape = Shape::Vector {
            len: array.len() as u64,
        };
        Ok(Handled::Chunks(encode(name, &array, shape, p.chunk_size)?))
    }

    fn handle_upload_file(
        &self,
        session: &mut Session,
        params: &Value,
        upload: Vec<Chunk>,
    ) -> Result<Value, SimError> {
        let p: UploadFileParams = Self::params(params)?;
        let data = decode_bytes(&mut ChunkStream::from_chunks(upload))?;
        let length = session.engine_mut().put_file(&p.filename, data)?;
        tracing::debug!("[{}] Stored file {} ({} bytes)", session.peer, p.filename, length);
        Ok(serde_json::to_value(UploadFileResult {
            filename: p.filename,
            length,
        })?)
    }

    fn handle_download_file(&self, session: &Session, params: &Value) -> Result<Handled, SimError> {
        let p: DownloadFileParams = Self::params(params)?;
        let data = session.engine().file(&p.filename)?;
        Ok(Handled::Chunks(encode_bytes(&p.filename, data, p.chunk_size)?))
    }
}
