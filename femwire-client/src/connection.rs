//! Blocking TCP connection to an engine.
//!
//! The connection owns a single-threaded tokio runtime and drives every
//! round trip to completion on it, so callers never see async.

use crate::error::ClientError;
use crate::transport::{Reply, Transport};
use femwire_protocol::message::{HelloParams, HelloResult};
use femwire_protocol::{
    Chunk, ChunkStream, Decoder, Encoder, Inbound, Operation, Request, PROTOCOL_VERSION,
};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

/// Default read buffer size (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Engine address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout, covering the whole round trip.
    pub request_timeout: Duration,
    /// Client name for HELLO.
    pub client_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Hold Ctrl-C until the in-flight round trip completes.
    pub defer_interrupts: bool,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            defer_interrupts: false,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_defer_interrupts(mut self, defer: bool) -> Self {
        self.defer_interrupts = defer;
        self
    }
}

/// A connection to an engine.
pub struct Connection {
    config: ConnectionConfig,
    runtime: Runtime,
    stream: Option<TcpStream>,
    decoder: Decoder,
    read_buf: Vec<u8>,
    server_name: String,
    session_id: String,
}

impl Connection {
    /// Connects and performs the HELLO handshake.
    pub fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        tracing::debug!("Connecting to {}...", config.addr);
        let stream = runtime.block_on(async {
            tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
                .await
                .map_err(|_| {
                    tracing::debug!("Connection timeout");
                    ClientError::Timeout
                })?
                .map_err(|e| {
                    tracing::debug!("Connection failed: {}", e);
                    ClientError::Io(e)
                })
        })?;
        stream.set_nodelay(true).ok();

        let read_buf = vec![0u8; config.read_buffer_size];
        let mut connection = Self {
            config,
            runtime,
            stream: Some(stream),
            decoder: Decoder::new(),
            read_buf,
            server_name: String::new(),
            session_id: String::new(),
        };
        connection.handshake()?;
        Ok(connection)
    }

    fn handshake(&mut self) -> Result<(), ClientError> {
        let hello = HelloParams {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
        };
        let request =
            Request::new("0", Operation::Hello).with_params(serde_json::to_value(hello)?);

        let response = match self.round_trip(&request, &[])? {
            Reply::Response(response) => response,
            Reply::Stream(_) => {
                return Err(ClientError::UnexpectedReply(
                    "stream in reply to HELLO".to_string(),
                ))
            }
        };
        if let Some(err) = response.error {
            return Err(ClientError::Engine {
                code: err.code,
                message: err.message,
            });
        }

        let result: HelloResult =
            serde_json::from_value(response.result.unwrap_or_default())?;
        if result.protocol_version != PROTOCOL_VERSION {
            return Err(femwire_protocol::ProtocolError::UnsupportedVersion(
                result.protocol_version,
            )
            .into());
        }
        tracing::debug!(
            "Handshake complete: server={} {} session={}",
            result.server_name,
            result.server_version,
            result.session_id
        );
        self.server_name = result.server_name;
        self.session_id = result.session_id;
        Ok(())
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Server name reported during the handshake.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Engine-side session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Transport for Connection {
    fn round_trip(&mut self, request: &Request, upload: &[Chunk]) -> Result<Reply, ClientError> {
        let Self {
            config,
            runtime,
            stream,
            decoder,
            read_buf,
            ..
        } = self;
        let stream = stream.as_mut().ok_or(ClientError::NotConnected)?;
        let timed = async {
            tokio::time::timeout(
                config.request_timeout,
                exchange(stream, decoder, read_buf, request, upload),
            )
            .await
            .map_err(|_| {
                tracing::debug!("Request id={} timed out", request.id);
                ClientError::Timeout
            })?
        };

        if !config.defer_interrupts {
            return runtime.block_on(timed);
        }

        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        runtime.block_on(defer_interrupt(timed, ctrl_c, &request.id))
    }

    fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!("Closing connection to {}", self.config.addr);
            self.runtime.block_on(async {
                let _ = stream.shutdown().await;
            });
        }
        self.decoder.clear();
        Ok(())
    }
}

/// Runs `work` to completion even if `interrupt` fires first; an interrupt
/// turns a successful result into [`ClientError::Interrupted`].
async fn defer_interrupt<T, W, I>(work: W, interrupt: I, request_id: &str) -> Result<T, ClientError>
where
    W: Future<Output = Result<T, ClientError>>,
    I: Future<Output = ()>,
{
    tokio::pin!(work);
    tokio::pin!(interrupt);
    let mut interrupted = false;
    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            _ = &mut interrupt, if !interrupted => {
                tracing::warn!("Interrupt received, waiting for request id={} to finish", request_id);
                interrupted = true;
            }
        }
    };
    match result {
        Ok(_) if interrupted => Err(ClientError::Interrupted),
        other => other,
    }
}

async fn exchange(
    stream: &mut TcpStream,
    decoder: &mut Decoder,
    buf: &mut [u8],
    request: &Request,
    upload: &[Chunk],
) -> Result<Reply, ClientError> {
    if decoder.buffered() > 0 {
        return Err(ClientError::UnexpectedReply(format!(
            "{} stray bytes before request {}",
            decoder.buffered(),
            request.id
        )));
    }
    let streaming = request.op.streams_reply();

    let encoded = Encoder::encode_request(request)?;
    stream.write_all(&encoded).await?;
    if request.op.carries_upload() {
        for chunk in upload {
            stream.write_all(&Encoder::encode_chunk(chunk)?).await?;
        }
        stream.write_all(&Encoder::encode_end_of_stream()?).await?;
    }
    stream.flush().await?;
    tracing::debug!(
        "Request id={} op={:?} sent ({} upload chunks)",
        request.id,
        request.op,
        upload.len()
    );

    let mut collected: Option<ChunkStream> = None;
    loop {
        while let Some(message) = decoder.decode_message()? {
            match message {
                Inbound::Response(response) if collected.is_none() => {
                    if response.id != request.id {
                        return Err(ClientError::UnexpectedReply(format!(
                            "response id {} for request {}",
                            response.id, request.id
                        )));
                    }
                    return Ok(Reply::Response(response));
                }
                Inbound::Chunk(chunk) if streaming => {
                    collected.get_or_insert_with(ChunkStream::new).push(chunk)
                }
                Inbound::EndOfStream if streaming => {
                    let received = collected.take().unwrap_or_default();
                    tracing::debug!(
                        "Request id={} received stream of {} chunks",
                        request.id,
                        received.len()
                    );
                    return Ok(Reply::Stream(received));
                }
                other => {
                    return Err(ClientError::UnexpectedReply(format!(
                        "{:?} while waiting for request {}",
                        other, request.id
                    )))
                }
            }
        }

        let n = stream.read(buf).await?;
        if n == 0 {
            tracing::debug!("Connection closed (0 bytes)");
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use femwire_protocol::message::RunResult;
    use femwire_protocol::{encode, Array, Response, Shape};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Serves one connection with a blocking socket, answering each request
    /// with `reply(request)` after draining any upload stream.
    fn serve_once<F>(reply: F) -> SocketAddr
    where
        F: Fn(&Request, usize) -> Vec<u8> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut decoder = Decoder::new();
            let mut buf = [0u8; 4096];
            let mut pending: Option<Request> = None;
            let mut uploaded = 0;
            loop {
                while let Some(message) = decoder.decode_message().unwrap() {
                    match message {
                        Inbound::Request(req) if req.op.carries_upload() => pending = Some(req),
                        Inbound::Request(req) => socket.write_all(&reply(&req, 0)).unwrap(),
                        Inbound::Chunk(_) => uploaded += 1,
                        Inbound::EndOfStream => {
                            if let Some(req) = pending.take() {
                                socket.write_all(&reply(&req, uploaded)).unwrap();
                            }
                            uploaded = 0;
                        }
                        Inbound::Response(_) => unreachable!(),
                    }
                }
                let n = socket.read(&mut buf).unwrap_or(0);
                if n == 0 {
                    return;
                }
                decoder.extend(&buf[..n]);
            }
        });
        addr
    }

    fn hello_reply(req: &Request) -> Vec<u8> {
        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            server_name: "test".to_string(),
            server_version: "0".to_string(),
            session_id: "s-1".to_string(),
        };
        let response = Response::ok(&req.id, serde_json::to_value(result).unwrap());
        Encoder::encode_response(&response).unwrap().to_vec()
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:50052".parse().unwrap());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.defer_interrupts);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config =
            ConnectionConfig::new("127.0.0.1:50052".parse().unwrap()).with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new("127.0.0.1:50052".parse().unwrap())
            .with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_handshake_and_run() {
        let addr = serve_once(|req, _| match req.op {
            Operation::Hello => hello_reply(req),
            _ => {
                let result = RunResult {
                    output: "done".to_string(),
                };
                let response = Response::ok(&req.id, serde_json::to_value(result).unwrap());
                Encoder::encode_response(&response).unwrap().to_vec()
            }
        });

        let mut conn = Connection::connect(ConnectionConfig::new(addr)).unwrap();
        assert_eq!(conn.session_id(), "s-1");
        assert_eq!(conn.server_name(), "test");

        let request = Request::new("1", Operation::Run)
            .with_params(serde_json::json!({"command": "/PREP7"}));
        match conn.round_trip(&request, &[]).unwrap() {
            Reply::Response(response) => {
                assert!(response.is_ok());
                assert_eq!(response.result.unwrap()["output"], "done");
            }
            Reply::Stream(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn test_stream_reply_and_upload() {
        let addr = serve_once(|req, uploaded| match req.op {
            Operation::Hello => hello_reply(req),
            Operation::SetVecData => {
                let response =
                    Response::ok(&req.id, serde_json::json!({ "uploaded_chunks": uploaded }));
                Encoder::encode_response(&response).unwrap().to_vec()
            }
            _ => {
                let array = Array::from(vec![1i32, 2, 3]);
                let chunks = encode("", &array, Shape::Vector { len: 3 }, 5).unwrap();
                Encoder::encode_stream(&chunks).unwrap().to_vec()
            }
        });

        let mut conn = Connection::connect(ConnectionConfig::new(addr)).unwrap();

        let request = Request::new("1", Operation::Nodes);
        match conn.round_trip(&request, &[]).unwrap() {
            Reply::Stream(mut stream) => {
                assert_eq!(stream.len(), 3);
                let array = femwire_protocol::decode(&mut stream, None).unwrap();
                assert_eq!(array.as_slice::<i32>().unwrap(), &[1, 2, 3]);
            }
            Reply::Response(_) => panic!("expected a stream"),
        }

        let array = Array::from(vec![0.5f64; 10]);
        let chunks = encode("V", &array, Shape::Vector { len: 10 }, 16).unwrap();
        let request = Request::new("2", Operation::SetVecData);
        match conn.round_trip(&request, &chunks).unwrap() {
            Reply::Response(response) => {
                assert_eq!(response.result.unwrap()["uploaded_chunks"], 5);
            }
            Reply::Stream(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn test_stray_end_of_stream_is_rejected() {
        let addr = serve_once(|req, _| match req.op {
            Operation::Hello => hello_reply(req),
            Operation::Nodes => {
                let array = Array::from(vec![1.0f64, 2.0]);
                let chunks = encode("", &array, Shape::Vector { len: 2 }, 8).unwrap();
                let mut wire = Encoder::encode_stream(&chunks).unwrap();
                wire.extend_from_slice(&Encoder::encode_end_of_stream().unwrap());
                wire.to_vec()
            }
            _ => Encoder::encode_response(&Response::ok(&req.id, serde_json::json!({})))
                .unwrap()
                .to_vec(),
        });
        let mut conn = Connection::connect(ConnectionConfig::new(addr)).unwrap();

        let nodes = Request::new("1", Operation::Nodes);
        assert!(matches!(conn.round_trip(&nodes, &[]), Ok(Reply::Stream(_))));

        let ping = Request::new("2", Operation::Ping);
        assert!(matches!(
            conn.round_trip(&ping, &[]),
            Err(ClientError::UnexpectedReply(_))
        ));
    }

    #[test]
    fn test_stream_for_plain_operation_is_rejected() {
        let addr = serve_once(|req, _| match req.op {
            Operation::Hello => hello_reply(req),
            _ => {
                let chunks = encode("", &Array::from(vec![7i32]), Shape::Vector { len: 1 }, 4).unwrap();
                Encoder::encode_stream(&chunks).unwrap().to_vec()
            }
        });
        let mut conn = Connection::connect(ConnectionConfig::new(addr)).unwrap();

        let request = Request::new("1", Operation::Run)
            .with_params(serde_json::json!({"command": "/PREP7"}));
        assert!(matches!(
            conn.round_trip(&request, &[]),
            Err(ClientError::UnexpectedReply(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupt_waits_for_round_trip() {
        let finished = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&finished);
        let work = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            done.store(true, Ordering::SeqCst);
            Ok::<_, ClientError>(42)
        };

        let result = defer_interrupt(work, std::future::ready(()), "7").await;
        assert!(matches!(result, Err(ClientError::Interrupted)));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_interrupt_keeps_result() {
        let work = async { Ok::<_, ClientError>(42) };
        let result = defer_interrupt(work, std::future::pending(), "7").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_interrupt_keeps_round_trip_error() {
        let work = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), _>(ClientError::ConnectionClosed)
        };
        let result = defer_interrupt(work, std::future::ready(()), "7").await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    }

    #[test]
    fn test_closed_connection() {
        let addr = serve_once(|req, _| match req.op {
            Operation::Hello => hello_reply(req),
            _ => Vec::new(),
        });
        let mut conn = Connection::connect(ConnectionConfig::new(addr)).unwrap();
        conn.close().unwrap();
        assert!(!conn.is_connected());

        let request = Request::new("1", Operation::Ping);
        assert!(matches!(
            conn.round_trip(&request, &[]),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ConnectionConfig::new(addr).with_connect_timeout(Duration::from_secs(2));
        assert!(Connection::connect(config).is_err());
    }
}
