//! Scripted transports for unit tests.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::session::Session;
use crate::transport::{Reply, Transport};
use femwire_protocol::{decode, encode, Array, Chunk, ChunkStream, Operation, Request, Response, Shape};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

struct Scripted<F>(F);

impl<F> Transport for Scripted<F>
where
    F: FnMut(&Request, &[Chunk]) -> Result<Reply, ClientError> + Send,
{
    fn round_trip(&mut self, request: &Request, upload: &[Chunk]) -> Result<Reply, ClientError> {
        (self.0)(request, upload)
    }
}

/// A session whose every round trip is answered by `f`. Names use prefix `T`.
pub(crate) fn scripted<F>(f: F) -> Session
where
    F: FnMut(&Request, &[Chunk]) -> Result<Reply, ClientError> + Send + 'static,
{
    let mut config = ClientConfig::default();
    config.workspace.name_prefix = Some("T".to_string());
    Session::with_transport(Scripted(f), &config).unwrap()
}

pub(crate) fn ok(request: &Request, result: Value) -> Reply {
    Reply::Response(Response::ok(&request.id, result))
}

pub(crate) fn stream_of(array: &Array, chunk_size: usize) -> Reply {
    let shape = Shape::Vector {
        len: array.len() as u64,
    };
    let chunks = encode("", array, shape, chunk_size).unwrap();
    Reply::Stream(ChunkStream::from_chunks(chunks))
}

type ParamFn = Box<dyn Fn(&str) -> Option<f64> + Send>;

struct RecorderState {
    commands: Vec<String>,
    uploads: Vec<(String, Array)>,
    files: Vec<String>,
    scalar: f64,
    param_fn: Option<ParamFn>,
    mattype: Option<u8>,
    shape: (u64, u64),
    object_shapes: HashMap<String, (u64, u64)>,
}

impl RecorderState {
    fn reply(&mut self, request: &Request, upload: &[Chunk]) -> Reply {
        let result = match request.op {
            Operation::Run => {
                let command = request.params["command"].as_str().unwrap_or_default();
                self.commands.push(command.to_string());
                json!({ "output": "" })
            }
            Operation::GetParameter => {
                let name = request.params["name"].as_str().unwrap_or_default();
                let value = match &self.param_fn {
                    Some(f) => f(name),
                    None => Some(self.scalar),
                };
                json!({ "value": value })
            }
            Operation::DataInfo => {
                let name = request.params["name"].as_str().unwrap_or_default();
                let (size1, size2) = self.object_shapes.get(name).copied().unwrap_or(self.shape);
                json!({
                    "name": name,
                    "objtype": "DMAT",
                    "stype": "float64",
                    "size1": size1,
                    "size2": size2,
                    "mattype": self.mattype,
                })
            }
            Operation::SetVecData | Operation::SetMatData => {
                let mut stream = ChunkStream::from_chunks(upload.to_vec());
                let header = stream.header().cloned().unwrap();
                let array = decode(&mut stream, None).unwrap();
                self.uploads.push((header.name.clone(), array));
                json!({ "name": header.name, "shape": header.shape })
            }
            Operation::ListFiles => json!({ "files": self.files }),
            _ => Value::Null,
        };
        ok(request, result)
    }
}

/// Records the commands a session sends and answers with canned values.
pub(crate) struct Recorder {
    state: Arc<Mutex<RecorderState>>,
    session: Session,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        let state = Arc::new(Mutex::new(RecorderState {
            commands: Vec::new(),
            uploads: Vec::new(),
            files: Vec::new(),
            scalar: 1.0,
            param_fn: None,
            mattype: Some(3),
            shape: (3, 3),
            object_shapes: HashMap::new(),
        }));
        let shared = Arc::clone(&state);
        let session = scripted(move |request, upload| Ok(shared.lock().reply(request, upload)));
        Self { state, session }
    }

    /// Every scalar read returns `value`.
    pub(crate) fn with_scalar(self, value: f64) -> Self {
        self.state.lock().scalar = value;
        self
    }

    /// Scalar reads are answered by `f(name)`.
    pub(crate) fn with_param_fn<F>(self, f: F) -> Self
    where
        F: Fn(&str) -> Option<f64> + Send + 'static,
    {
        self.state.lock().param_fn = Some(Box::new(f));
        self
    }

    pub(crate) fn with_mattype(self, mattype: Option<u8>) -> Self {
        self.state.lock().mattype = mattype;
        self
    }

    /// Shape reported for every object.
    pub(crate) fn with_shape(self, rows: u64, cols: u64) -> Self {
        self.state.lock().shape = (rows, cols);
        self
    }

    /// Shape reported for `name` only.
    pub(crate) fn set_object_shape(&self, name: &str, rows: u64, cols: u64) {
        self.state.lock().object_shapes.insert(name.to_string(), (rows, cols));
    }

    pub(crate) fn session(&self) -> Session {
        self.session.clone()
    }

    /// `RUN` commands in order.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub(crate) fn uploads(&self) -> Vec<(String, Array)> {
        self.state.lock().uploads.clone()
    }

    pub(crate) fn add_file(&self, name: &str) {
        self.state.lock().files.push(name.to_string());
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.commands.clear();
        state.uploads.clear();
    }
}
