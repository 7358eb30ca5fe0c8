//! TCP server implementation.

use crate::config::{EngineConfig, SimConfig};
use crate::error::SimError;
use crate::handler::{CommandHandler, Outcome, ServerInfo};
use crate::session::{Session, SessionState};
use femwire_protocol::{Chunk, Decoder, Encoder, Inbound, Request};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Settings for each session's engine.
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&SimConfig::default())
    }
}

impl From<&SimConfig> for ServerConfig {
    fn from(config: &SimConfig) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            engine: config.engine.clone(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// A request waiting for its upload stream to finish.
struct PendingUpload {
    request: Request,
    chunks: Vec<Chunk>,
}

/// TCP server for the reference engine.
pub struct Server {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let info = ServerInfo {
            name: config.engine.server_name.clone(),
            ..ServerInfo::default()
        };
        Self {
            config,
            handler: Arc::new(CommandHandler::new(info)),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), SimError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SimError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Engine listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let handler = self.handler.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    tcp_stream,
                                    addr,
                                    handler,
                                    &config,
                                    &stats,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Engine shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handles a single connection.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<CommandHandler>,
        config: &ServerConfig,
        stats: &ServerStats,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), SimError> {
        tracing::info!("Client connected: {}", addr);
        stream.set_nodelay(true)?;

        let mut session = Session::new(addr.to_string(), &config.engine);
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut pending: Option<PendingUpload> = None;

        loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => decoder.extend(&buf[..n]),
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(SimError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout) => {
                    if session.idle_duration() > config.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(SimError::ShuttingDown);
                }
            }

            while let Some(message) = decoder.decode_message()? {
                let (request, upload) = match (message, pending.take()) {
                    (Inbound::Request(request), None) if request.op.carries_upload() => {
                        pending = Some(PendingUpload {
                            request,
                            chunks: Vec::new(),
                        });
                        continue;
                    }
                    (Inbound::Request(request), None) => (request, Vec::new()),
                    (Inbound::Chunk(chunk), Some(mut upload)) => {
                        upload.chunks.push(chunk);
                        pending = Some(upload);
                        continue;
                    }
                    (Inbound::EndOfStream, Some(upload)) => (upload.request, upload.chunks),
                    (other, _) => {
                        return Err(SimError::InvalidRequest(format!(
                            "unexpected {:?} from client",
                            other
                        )));
                    }
                };

                stats.requests_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "[{}] Request: {:?} (id={}, {} upload chunks)",
                    addr,
                    request.op,
                    request.id,
                    upload.len()
                );

                let outcome = handler.handle(&mut session, &request, upload);
                if !outcome.is_ok() {
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
                let bytes = match &outcome {
                    Outcome::Response(response) => Encoder::encode_response(response)?,
                    Outcome::Stream(chunks) => Encoder::encode_stream(chunks)?,
                };
                tracing::debug!(
                    "[{}] Reply to id={}: {} bytes ({})",
                    addr,
                    request.id,
                    bytes.len(),
                    if outcome.is_ok() { "OK" } else { "ERROR" }
                );
                stream.write_all(&bytes).await?;

                if session.state() == SessionState::Closing {
                    tracing::debug!("[{}] Session closing", addr);
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use femwire_protocol::message::Operation;
    use femwire_protocol::{decode, encode, Array, ChunkStream, Shape, PROTOCOL_VERSION};
    use serde_json::json;

    async fn start() -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(ServerConfig::new(addr)));
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (server, addr)
    }

    /// Reads until one reply is complete.
    async fn read_reply(stream: &mut TcpStream, decoder: &mut Decoder) -> Result<Inbound, ()> {
        let mut chunks = ChunkStream::new();
        let mut buf = [0u8; 4096];
        loop {
            while let Some(message) = decoder.decode_message().unwrap() {
                match message {
                    Inbound::Chunk(chunk) => chunks.push(chunk),
                    Inbound::EndOfStream => {
                        let array = decode(&mut chunks, None).unwrap();
                        return Ok(Inbound::Response(femwire_protocol::Response::ok(
                            "stream",
                            json!(array.to_f64().unwrap()),
                        )));
                    }
                    other => return Ok(other),
                }
            }
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return Err(());
            }
            decoder.extend(&buf[..n]);
        }
    }

    async fn send(stream: &mut TcpStream, id: &str, op: Operation, params: serde_json::Value) {
        let request = Request::new(id, op).with_params(params);
        stream
            .write_all(&Encoder::encode_request(&request).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_not_running_before_serve() {
        let server = Server::new(ServerConfig::default());
        assert!(!server.is_running());
        assert_eq!(server.config().max_connections, 64);
    }

    #[tokio::test]
    async fn test_hello_upload_download_exit() {
        let (server, addr) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::new();

        send(&mut stream, "0", Operation::Hello, json!({"protocol_version": PROTOCOL_VERSION})).await;
        match read_reply(&mut stream, &mut decoder).await.unwrap() {
            Inbound::Response(r) => assert!(r.is_ok()),
            other => panic!("unexpected {:?}", other),
        }

        send(&mut stream, "1", Operation::SetVecData, json!({})).await;
        let data = Array::from(vec![1.5, 2.5, 3.5]);
        for chunk in encode("x", &data, Shape::Vector { len: 3 }, 8).unwrap() {
            stream
                .write_all(&Encoder::encode_chunk(&chunk).unwrap())
                .await
                .unwrap();
        }
        stream
            .write_all(&Encoder::encode_end_of_stream().unwrap())
            .await
            .unwrap();
        match read_reply(&mut stream, &mut decoder).await.unwrap() {
            Inbound::Response(r) => assert_eq!(r.id, "1"),
            other => panic!("unexpected {:?}", other),
        }

        send(&mut stream, "2", Operation::GetVecData, json!({"name": "X", "chunk_size": 8})).await;
        match read_reply(&mut stream, &mut decoder).await.unwrap() {
            Inbound::Response(r) => assert_eq!(r.result.unwrap(), json!([1.5, 2.5, 3.5])),
            other => panic!("unexpected {:?}", other),
        }

        send(&mut stream, "3", Operation::Exit, json!({})).await;
        assert!(read_reply(&mut stream, &mut decoder).await.is_ok());
        assert!(read_reply(&mut stream, &mut decoder).await.is_err());

        assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 4);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connections_are_isolated() {
        let (server, addr) = start().await;
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        let (mut da, mut db) = (Decoder::new(), Decoder::new());

        for (s, d) in [(&mut a, &mut da), (&mut b, &mut db)] {
            send(s, "0", Operation::Hello, json!({"protocol_version": PROTOCOL_VERSION})).await;
            read_reply(s, d).await.unwrap();
        }
        send(&mut a, "1", Operation::Run, json!({"command": "*VEC,V,D,ALLOC,2"})).await;
        read_reply(&mut a, &mut da).await.unwrap();

        send(&mut b, "1", Operation::DataInfo, json!({"name": "V"})).await;
        match read_reply(&mut b, &mut db).await.unwrap() {
            Inbound::Response(r) => assert!(r.is_error()),
            other => panic!("unexpected {:?}", other),
        }
        server.shutdown();
    }
}
