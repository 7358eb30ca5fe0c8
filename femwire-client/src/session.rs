//! Engine sessions.
//!
//! A [`Session`] serializes every round trip through one lock and turns any
//! transport failure into a permanent [`ClientError::SessionTerminated`].
//! Handles created from a session keep only a [`WeakSession`].

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::math::MathApi;
use crate::mesh::MeshCache;
use crate::names::{validate_name, NameAllocator};
use crate::transport::{Reply, Transport};
use bytes::Bytes;
use femwire_protocol::message::{
    DataInfo, DownloadFileParams, GetParameterParams, GetParams, ListFilesResult, NameParams,
    RunParams, RunResult, ScalarResult, ScalarValue, SetDataResult, StreamParams, StreamRequest,
    UploadFileParams, UploadFileResult, VgetParams,
};
use femwire_protocol::{
    decode, decode_bytes, encode, encode_bytes, Array, Chunk, ChunkStream, Operation, Request,
    Shape, ValueType,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Longest command line the engine accepts, exclusive.
pub const MAX_COMMAND_LEN: usize = 640;

enum Link {
    Open(Box<dyn Transport>),
    Closed(String),
}

struct Inner {
    link: Mutex<Link>,
    alive: AtomicBool,
    next_id: AtomicU64,
    names: NameAllocator,
    chunk_size: usize,
    file_chunk_size: usize,
    mesh: MeshCache,
}

/// A live session with one engine.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

/// A non-owning reference to a session.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<Inner>,
}

impl WeakSession {
    /// Returns the session, or `SessionTerminated` once it has been dropped.
    pub fn upgrade(&self) -> Result<Session, ClientError> {
        self.inner
            .upgrade()
            .map(|inner| Session { inner })
            .ok_or_else(|| ClientError::SessionTerminated("session dropped".to_string()))
    }
}

impl std::fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakSession")
            .field("live", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Session {
    /// Connects over TCP using `config`.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let connection = Connection::connect(config.connection())?;
        tracing::info!(
            "Connected to {} ({}), session {}",
            config.engine.addr,
            connection.server_name(),
            connection.session_id()
        );
        Self::with_transport(connection, config)
    }

    /// Builds a session over an already established transport.
    pub fn with_transport<T>(transport: T, config: &ClientConfig) -> Result<Self, ClientError>
    where
        T: Transport + 'static,
    {
        config.validate()?;
        let names = match &config.workspace.name_prefix {
            Some(prefix) => NameAllocator::new(prefix.clone())?,
            None => NameAllocator::random(),
        };
        let inner = Arc::new_cyclic(|weak| Inner {
            link: Mutex::new(Link::Open(Box::new(transport))),
            alive: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            names,
            chunk_size: config.transfer.chunk_size,
            file_chunk_size: config.transfer.file_chunk_size,
            mesh: MeshCache::new(WeakSession {
                inner: weak.clone(),
            }),
        });
        Ok(Self { inner })
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether the transport is still usable.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn names(&self) -> &NameAllocator {
        &self.inner.names
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Entry point for workspace math objects.
    pub fn math(&self) -> MathApi {
        MathApi::new(self.downgrade())
    }

    /// The session's mesh cache.
    pub fn mesh(&self) -> &MeshCache {
        &self.inner.mesh
    }

    // ------------------------------------------------------------------
    // Round trips
    // ------------------------------------------------------------------

    fn build_request(&self, op: Operation, params: impl Serialize) -> Result<Request, ClientError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        Ok(Request::new(id, op).with_params(serde_json::to_value(params)?))
    }

    /// One locked round trip. Any transport failure other than an interrupt
    /// terminates the session, and so does a stream answering an operation
    /// that never streams.
    fn exchange(&self, request: &Request, upload: &[Chunk]) -> Result<Reply, ClientError> {
        let mut link = self.inner.link.lock();
        let transport = match &mut *link {
            Link::Open(transport) => transport,
            Link::Closed(reason) => return Err(ClientError::SessionTerminated(reason.clone())),
        };

        tracing::debug!("Request id={} op={:?}", request.id, request.op);
        let result = transport
            .round_trip(request, upload)
            .and_then(|reply| match reply {
                Reply::Stream(_) if !request.op.streams_reply() => Err(
                    ClientError::UnexpectedReply(format!("stream in reply to {:?}", request.op)),
                ),
                reply => Ok(reply),
            });
        match result {
            Ok(reply) => Ok(reply),
            Err(ClientError::Interrupted) => Err(ClientError::Interrupted),
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("Session terminated during {:?}: {}", request.op, reason);
                if let Link::Open(mut transport) =
                    std::mem::replace(&mut *link, Link::Closed(reason.clone()))
                {
                    let _ = transport.close();
                }
                self.inner.alive.store(false, Ordering::Release);
                Err(ClientError::SessionTerminated(reason))
            }
        }
    }

    fn request_with_upload(
        &self,
        op: Operation,
        params: impl Serialize,
        upload: &[Chunk],
    ) -> Result<Value, ClientError> {
        let request = self.build_request(op, params)?;
        match self.exchange(&request, upload)? {
            Reply::Response(response) => match response.error {
                Some(err) => {
                    tracing::debug!("Engine rejected {:?}: {}", op, err.message);
                    Err(ClientError::Engine {
                        code: err.code,
                        message: err.message,
                    })
                }
                None => Ok(response.result.unwrap_or(Value::Null)),
            },
            Reply::Stream(_) => Err(ClientError::UnexpectedReply(format!(
                "stream in reply to {:?}",
                op
            ))),
        }
    }

    fn request(&self, op: Operation, params: impl Serialize) -> Result<Value, ClientError> {
        self.request_with_upload(op, params, &[])
    }

    fn request_as<R: DeserializeOwned>(
        &self,
        op: Operation,
        params: impl Serialize,
    ) -> Result<R, ClientError> {
        let value = self.request(op, params)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Receives a stream. A plain success envelope means the stream never
    /// started.
    fn fetch_stream(&self, op: Operation, params: impl Serialize) -> Result<ChunkStream, ClientError> {
        let request = self.build_request(op, params)?;
        match self.exchange(&request, &[])? {
            Reply::Stream(stream) => Ok(stream),
            Reply::Response(response) => match response.error {
                Some(err) => Err(ClientError::Engine {
                    code: err.code,
                    message: err.message,
                }),
                None => Ok(ChunkStream::inactive()),
            },
        }
    }

    fn fetch(
        &self,
        op: Operation,
        params: impl Serialize,
        explicit: Option<ValueType>,
    ) -> Result<Array, ClientError> {
        let mut stream = self.fetch_stream(op, params)?;
        let array = decode(&mut stream, explicit)?;
        tracing::debug!("{:?} decoded {} {} elements", op, array.len(), array.value_type());
        Ok(array)
    }

    // ------------------------------------------------------------------
    // Commands and scalars
    // ------------------------------------------------------------------

    /// Round trip with no side effects.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.request(Operation::Ping, serde_json::json!({}))?;
        Ok(())
    }

    /// Runs one engine command and returns its text output.
    ///
    /// Any command may change the model, so the mesh cache is invalidated
    /// unless a populate is in progress.
    pub fn run(&self, command: &str) -> Result<String, ClientError> {
        validate_command(command)?;
        self.inner.mesh.invalidate();
        let result: RunResult = self.request_as(
            Operation::Run,
            RunParams {
                command: command.to_string(),
            },
        )?;
        Ok(result.output)
    }

    /// Value of a scalar parameter, `None` when undefined.
    pub fn parameter(&self, name: &str) -> Result<Option<ScalarValue>, ClientError> {
        validate_name(name)?;
        let result: ScalarResult = self.request_as(
            Operation::GetParameter,
            GetParameterParams {
                name: name.to_string(),
            },
        )?;
        Ok(result.value)
    }

    /// Numeric value of a scalar parameter.
    pub fn scalar_param(&self, name: &str) -> Result<f64, ClientError> {
        match self.parameter(name)? {
            Some(ScalarValue::Number(v)) => Ok(v),
            other => Err(ClientError::UnexpectedReply(format!(
                "parameter {} is not numeric: {:?}",
                name, other
            ))),
        }
    }

    /// `*GET` query, `None` when the engine has no value.
    pub fn get(
        &self,
        entity: &str,
        entnum: &str,
        item1: &str,
        it1num: &str,
    ) -> Result<Option<ScalarValue>, ClientError> {
        let result: ScalarResult = self.request_as(
            Operation::Get,
            GetParams {
                entity: entity.to_string(),
                entnum: entnum.to_string(),
                item1: item1.to_string(),
                it1num: it1num.to_string(),
            },
        )?;
        Ok(result.value)
    }

    /// Numeric `*GET` query.
    pub fn get_value(
        &self,
        entity: &str,
        entnum: &str,
        item1: &str,
        it1num: &str,
    ) -> Result<f64, ClientError> {
        self.get(entity, entnum, item1, it1num)?
            .and_then(|v| v.as_f64())
            .ok_or_else(|| {
                ClientError::UnexpectedReply(format!(
                    "*GET {},{},{},{} returned no number",
                    entity, entnum, item1, it1num
                ))
            })
    }

    // ------------------------------------------------------------------
    // Workspace data
    // ------------------------------------------------------------------

    /// Metadata of a workspace object.
    pub fn data_info(&self, name: &str) -> Result<DataInfo, ClientError> {
        validate_name(name)?;
        self.request_as(
            Operation::DataInfo,
            NameParams {
                name: name.to_string(),
            },
        )
    }

    /// Downloads a workspace vector. `explicit` overrides the stream's tag.
    pub fn vec_data(&self, name: &str, explicit: Option<ValueType>) -> Result<Array, ClientError> {
        validate_name(name)?;
        self.fetch_vec(name, explicit)
    }

    /// Vector download that also accepts engine-derived names such as
    /// `K::VALS`.
    pub(crate) fn fetch_vec(
        &self,
        name: &str,
        explicit: Option<ValueType>,
    ) -> Result<Array, ClientError> {
        self.fetch(
            Operation::GetVecData,
            StreamParams {
                name: name.to_string(),
                chunk_size: self.inner.chunk_size,
            },
            explicit,
        )
    }

    /// Downloads a dense workspace matrix in column-major order.
    pub fn mat_data(&self, name: &str) -> Result<Array, ClientError> {
        validate_name(name)?;
        self.fetch(
            Operation::GetMatData,
            StreamParams {
                name: name.to_string(),
                chunk_size: self.inner.chunk_size,
            },
            None,
        )
    }

    /// Creates or overwrites a workspace vector.
    pub fn set_vec(&self, name: &str, data: &Array) -> Result<(), ClientError> {
        let shape = Shape::Vector {
            len: data.len() as u64,
        };
        self.upload_array(Operation::SetVecData, name, data, shape)
    }

    /// Creates or overwrites a dense workspace matrix from column-major data.
    pub fn set_mat(&self, name: &str, data: &Array, rows: u64, cols: u64) -> Result<(), ClientError> {
        if rows * cols != data.len() as u64 {
            return Err(ClientError::ShapeMismatch(format!(
                "{}x{} matrix needs {} values, got {}",
                rows,
                cols,
                rows * cols,
                data.len()
            )));
        }
        self.upload_array(Operation::SetMatData, name, data, Shape::Matrix { rows, cols })
    }

    fn upload_array(
        &self,
        op: Operation,
        name: &str,
        data: &Array,
        shape: Shape,
    ) -> Result<(), ClientError> {
        validate_name(name)?;
        if data.value_type().type_char().is_none() {
            return Err(ClientError::UnsupportedType(data.value_type()));
        }
        let chunks = encode(name, data, shape, self.inner.chunk_size)?;
        let result: SetDataResult = serde_json::from_value(self.request_with_upload(
            op,
            NameParams {
                name: name.to_string(),
            },
            &chunks,
        )?)?;
        tracing::debug!(
            "Uploaded {} as {:?} in {} chunks",
            result.name,
            result.shape,
            chunks.len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mesh queries
    // ------------------------------------------------------------------

    /// `*VGET`-style bulk query.
    pub fn vget(
        &self,
        entity: &str,
        entnum: &str,
        item1: &str,
        it1num: &str,
    ) -> Result<Array, ClientError> {
        self.fetch(
            Operation::Vget,
            VgetParams {
                entity: entity.to_string(),
                entnum: entnum.to_string(),
                item1: item1.to_string(),
                it1num: it1num.to_string(),
                chunk_size: self.inner.chunk_size,
            },
            None,
        )
    }

    /// Coordinates of the selected nodes, flattened N×3.
    pub fn nodes(&self) -> Result<Array, ClientError> {
        self.fetch(Operation::Nodes, self.stream_request(), Some(ValueType::Float64))
    }

    /// Raw element connectivity of the selected elements.
    pub fn load_elements(&self) -> Result<Array, ClientError> {
        self.fetch(Operation::LoadElements, self.stream_request(), Some(ValueType::Int32))
    }

    /// Raw element type table.
    pub fn load_element_types(&self) -> Result<Array, ClientError> {
        self.fetch(
            Operation::LoadElementTypes,
            self.stream_request(),
            Some(ValueType::Int32),
        )
    }

    fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            chunk_size: self.inner.chunk_size,
        }
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Uploads a local file into the engine working directory.
    pub fn upload_file(&self, path: impl AsRef<Path>) -> Result<String, ClientError> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ClientError::InvalidName {
                name: path.display().to_string(),
                reason: "path has no file name",
            })?
            .to_string();
        let data = std::fs::read(path)?;
        self.upload_bytes(&filename, Bytes::from(data))?;
        Ok(filename)
    }

    /// Uploads raw bytes as a file named `filename`.
    pub fn upload_bytes(&self, filename: &str, data: Bytes) -> Result<u64, ClientError> {
        validate_name(filename)?;
        let chunks = encode_bytes(filename, data, self.inner.file_chunk_size)?;
        let result: UploadFileResult = serde_json::from_value(self.request_with_upload(
            Operation::UploadFile,
            UploadFileParams {
                filename: filename.to_string(),
            },
            &chunks,
        )?)?;
        tracing::debug!("Uploaded {} ({} bytes)", result.filename, result.length);
        Ok(result.length)
    }

    /// Downloads an engine file into memory.
    pub fn download_bytes(&self, filename: &str) -> Result<Bytes, ClientError> {
        validate_name(filename)?;
        let mut stream = self.fetch_stream(
            Operation::DownloadFile,
            DownloadFileParams {
                filename: filename.to_string(),
                chunk_size: self.inner.file_chunk_size,
            },
        )?;
        Ok(decode_bytes(&mut stream)?)
    }

    /// Downloads an engine file to `dest`. A directory destination keeps the
    /// engine file name.
    pub fn download_file(
        &self,
        filename: &str,
        dest: impl AsRef<Path>,
    ) -> Result<PathBuf, ClientError> {
        let data = self.download_bytes(filename)?;
        let dest = dest.as_ref();
        let target = if dest.is_dir() {
            dest.join(filename)
        } else {
            dest.to_path_buf()
        };
        std::fs::write(&target, &data)?;
        Ok(target)
    }

    /// Files in the engine working directory.
    pub fn list_files(&self) -> Result<Vec<String>, ClientError> {
        let result: ListFilesResult = self.request_as(Operation::ListFiles, serde_json::json!({}))?;
        Ok(result.files)
    }

    /// Ends the engine session and closes the transport.
    pub fn exit(&self) -> Result<(), ClientError> {
        let request = self.build_request(Operation::Exit, serde_json::json!({}))?;
        let result = self.exchange(&request, &[]);

        let mut link = self.inner.link.lock();
        if let Link::Open(mut transport) =
            std::mem::replace(&mut *link, Link::Closed("session exited".to_string()))
        {
            let _ = transport.close();
        }
        self.inner.alive.store(false, Ordering::Release);
        tracing::info!("Session exited");

        match result {
            Ok(_) | Err(ClientError::SessionTerminated(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Rejects commands the engine cannot take as a single line.
pub fn validate_command(command: &str) -> Result<(), ClientError> {
    if command.trim().is_empty() {
        return Err(ClientError::InvalidCommand("empty command".to_string()));
    }
    if command.contains('\n') || command.contains('\r') {
        return Err(ClientError::InvalidCommand(
            "multi-line commands are not accepted".to_string(),
        ));
    }
    if command.len() >= MAX_COMMAND_LEN {
        return Err(ClientError::InvalidCommand(format!(
            "command is {} characters, the limit is {}",
            command.len(),
            MAX_COMMAND_LEN - 1
        )));
    }
    Ok(())
}
