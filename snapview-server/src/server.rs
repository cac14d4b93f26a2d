//! WebSocket snapshot server with an embedded ingestion pipeline.
//!
//! Architecture:
//! ```text
//! Client A ──┐  GetSnapshot / GetSnapshotState / ListCollections
//!            ├──────────────► SnapshotStreamer (spawn_blocking)
//! Client B ──┘                      │  ChannelSink (bounded)
//!     │                             ▼
//!     │  Publish            SnapshotPacket × N, SnapshotEnd
//!     └──────────► delivery channel ──► IngestPipeline task
//!                                            │
//!                                    CollectionRegistry
//!                                    ├── users  (RocksDB)
//!                                    └── orders (RocksDB)
//! ```
//!
//! Requests on one connection are answered in order. Snapshot reads run on
//! the blocking pool against a point-in-time view, so they never hold up
//! ingestion and ingestion never changes a stream in flight.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use snapview_store::{
    ChannelSink, CollectionRegistry, Delivery, Disposition, IngestPipeline, IngestStats,
    ProjectionApplier, RegistryConfig, SnapshotChunk, SnapshotStreamer, StreamSummary,
    DEFAULT_CHUNK_SIZE,
};

use crate::protocol::{MessageType, RpcMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Base directory for collection databases
    pub data_dir: PathBuf,
    /// Records per snapshot packet
    pub chunk_size: usize,
    /// Packets buffered between a snapshot reader and its socket
    pub stream_buffer: usize,
    /// Deliveries buffered ahead of the ingestion pipeline
    pub ingest_buffer: usize,
    /// fsync every commit
    pub sync_writes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            data_dir: PathBuf::from("snapview_data"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            stream_buffer: 4,
            ingest_buffer: 1024,
            sync_writes: true,
        }
    }
}

impl ServerConfig {
    /// Ephemeral-port config over `data_dir` without fsync.
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: data_dir.into(),
            sync_writes: false,
            ..Self::default()
        }
    }

    /// Registry settings derived from this config.
    pub fn registry_config(&self) -> RegistryConfig {
        let mut config = RegistryConfig {
            data_dir: self.data_dir.clone(),
            ..RegistryConfig::default()
        };
        config.store.sync_writes = self.sync_writes;
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub snapshots_streamed: u64,
    pub records_streamed: u64,
    pub publishes_acked: u64,
    pub publishes_nacked: u64,
}

/// State shared by every connection task.
#[derive(Clone)]
struct ConnectionContext {
    streamer: Arc<SnapshotStreamer>,
    deliveries: mpsc::Sender<Delivery>,
    stats: Arc<RwLock<ServerStats>>,
    stream_buffer: usize,
}

/// The snapshot server.
pub struct SnapshotServer {
    config: ServerConfig,
    registry: Arc<CollectionRegistry>,
    streamer: Arc<SnapshotStreamer>,
    pipeline: Arc<IngestPipeline>,
    /// Sender side of the ingestion channel
    deliveries: mpsc::Sender<Delivery>,
    /// Taken by the first `serve_until`
    ingest_rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SnapshotServer {
    /// Create a server over a registry rooted at `config.data_dir`.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(CollectionRegistry::new(config.registry_config()));
        Self::with_registry(config, registry)
    }

    /// Create a server over an existing registry.
    pub fn with_registry(config: ServerConfig, registry: Arc<CollectionRegistry>) -> Self {
        let streamer =
            Arc::new(SnapshotStreamer::new(registry.clone()).with_chunk_size(config.chunk_size));
        let pipeline = Arc::new(IngestPipeline::new(ProjectionApplier::new(registry.clone())));
        let (deliveries, ingest_rx) = mpsc::channel(config.ingest_buffer.max(1));

        Self {
            config,
            registry,
            streamer,
            pipeline,
            deliveries,
            ingest_rx: Mutex::new(Some(ingest_rx)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Open every collection already on disk.
    pub async fn recover(&self) -> Result<usize, BoxError> {
        let registry = self.registry.clone();
        let recovered = tokio::task::spawn_blocking(move || registry.open_all()).await??;
        log::info!("Recovery complete: {recovered} collections restored");
        Ok(recovered)
    }

    /// Serve until the process is stopped.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.serve_until(std::future::pending::<()>()).await
    }

    /// Bind, recover, then serve until `shutdown` resolves.
    ///
    /// On shutdown the listener stops accepting and ingestion stops taking
    /// new deliveries. Once the last apply has settled, every open store is
    /// flushed.
    pub async fn serve_until<F>(&self, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve_listener<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        let ingest_rx = self
            .ingest_rx
            .lock()
            .await
            .take()
            .ok_or("snapshot server is already serving")?;

        self.recover().await?;
        let (stop_ingest, ingest_stop) = oneshot::channel::<()>();
        let ingest_task = tokio::spawn(self.pipeline.clone().run_until(ingest_rx, async move {
            let _ = ingest_stop.await;
        }));

        log::info!("Snapshot server listening on {}", listener.local_addr()?);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let ctx = self.context();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        // Deliveries still queued are never acked and will be redelivered.
        // The apply in flight finishes before the flush below.
        let _ = stop_ingest.send(());
        if let Err(e) = ingest_task.await {
            log::error!("Ingestion pipeline task failed: {e}");
        }

        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || registry.flush_all()).await??;
        log::info!("Flushed {} collections", self.registry.open_count());
        Ok(())
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            streamer: self.streamer.clone(),
            deliveries: self.deliveries.clone(),
            stats: self.stats.clone(),
            stream_buffer: self.config.stream_buffer.max(1),
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::serve_connection(ws_stream, addr, &ctx).await;

        ctx.stats.write().await.active_connections -= 1;
        result
    }

    async fn serve_connection(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        ctx: &ConnectionContext,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match RpcMessage::decode(&bytes) {
                        Ok(request) => {
                            ctx.stats.write().await.total_requests += 1;
                            Self::dispatch(request, &mut ws_sender, ctx).await?;
                        }
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                        }
                    }
                }
                Ok(Message::Ping(data)) => {
                    ws_sender.send(Message::Pong(data)).await?;
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
                _ => {}
            }
        }

        log::info!("Connection closed from {addr}");
        Ok(())
    }

    async fn dispatch(
        request: RpcMessage,
        ws_sender: &mut WsSender,
        ctx: &ConnectionContext,
    ) -> Result<(), BoxError> {
        match request.msg_type {
            MessageType::GetSnapshot => {
                Self::stream_snapshot(request.request_id, request.collection, ws_sender, ctx)
                    .await
            }

            MessageType::GetSnapshotState => {
                let streamer = ctx.streamer.clone();
                let collection = request.collection.clone();
                let state = tokio::task::spawn_blocking(move || streamer.state(&collection)).await?;
                let reply = match state {
                    Ok(Some(sequence)) => {
                        RpcMessage::snapshot_state(request.request_id, request.collection, sequence)
                    }
                    Ok(None) => RpcMessage::not_found(request.request_id, request.collection),
                    Err(e) => {
                        log::error!("State query for '{}' failed: {e}", request.collection);
                        RpcMessage::error(request.request_id, request.collection, e.to_string())
                    }
                };
                Self::send(ws_sender, &reply).await
            }

            MessageType::ListCollections => {
                let registry = ctx.streamer.registry().clone();
                let names = tokio::task::spawn_blocking(move || registry.collection_names()).await?;
                let reply = match names {
                    Ok(names) => RpcMessage::collection_list(request.request_id, &names)?,
                    Err(e) => RpcMessage::error(request.request_id, "", e.to_string()),
                };
                Self::send(ws_sender, &reply).await
            }

            MessageType::Publish => {
                let (request_id, sequence) = (request.request_id, request.sequence);
                let disposition = Self::publish(sequence, request.payload, ctx).await;
                let reply = match disposition {
                    Disposition::Ack => {
                        ctx.stats.write().await.publishes_acked += 1;
                        RpcMessage::ack(request_id, sequence)
                    }
                    Disposition::Nack => {
                        ctx.stats.write().await.publishes_nacked += 1;
                        RpcMessage::nack(request_id, sequence)
                    }
                };
                Self::send(ws_sender, &reply).await
            }

            MessageType::Ping => Self::send(ws_sender, &RpcMessage::pong(request.request_id)).await,

            other => {
                log::debug!("Unhandled message type: {other:?}");
                Ok(())
            }
        }
    }

    /// Stream a snapshot as packets followed by `SnapshotEnd`.
    ///
    /// If the socket fails, the channel receiver is dropped and the reader
    /// aborts at its next chunk, releasing its view.
    async fn stream_snapshot(
        request_id: u64,
        collection: String,
        ws_sender: &mut WsSender,
        ctx: &ConnectionContext,
    ) -> Result<(), BoxError> {
        let (tx, mut rx) = mpsc::channel::<SnapshotChunk>(ctx.stream_buffer);
        let streamer = ctx.streamer.clone();
        let name = collection.clone();
        let reader = tokio::task::spawn_blocking(move || {
            let mut sink = ChannelSink::new(tx);
            streamer.stream(&name, &mut sink)
        });

        while let Some(chunk) = rx.recv().await {
            let packet =
                RpcMessage::snapshot_packet(request_id, &chunk.collection, chunk.sequence, &chunk.entries)?;
            Self::send(ws_sender, &packet).await?;
        }

        let reply = match reader.await? {
            Ok(StreamSummary { sequence, records, chunks }) => {
                {
                    let mut s = ctx.stats.write().await;
                    s.snapshots_streamed += 1;
                    s.records_streamed += records as u64;
                }
                log::debug!(
                    "Sent snapshot of '{collection}': {records} records in {chunks} packets at sequence {sequence}"
                );
                RpcMessage::snapshot_end(request_id, collection, sequence, records as u64)
            }
            Err(e) => {
                log::error!("Snapshot of '{collection}' failed: {e}");
                RpcMessage::error(request_id, collection, e.to_string())
            }
        };
        Self::send(ws_sender, &reply).await
    }

    /// Hand a projection to the ingestion pipeline and wait for its disposition.
    async fn publish(sequence: u64, payload: Vec<u8>, ctx: &ConnectionContext) -> Disposition {
        let (delivery, reply) = Delivery::new(sequence, payload);
        if ctx.deliveries.send(delivery).await.is_err() {
            log::warn!("Ingestion pipeline stopped, rejecting sequence {sequence}");
            return Disposition::Nack;
        }
        // Dropped reply means the delivery was never settled.
        reply.await.unwrap_or(Disposition::Nack)
    }

    async fn send(ws_sender: &mut WsSender, msg: &RpcMessage) -> Result<(), BoxError> {
        let encoded = msg.encode()?;
        ws_sender.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    /// Sender feeding the ingestion pipeline, for in-process event transports.
    pub fn delivery_sender(&self) -> mpsc::Sender<Delivery> {
        self.deliveries.clone()
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Ingestion counters.
    pub fn ingest_stats(&self) -> IngestStats {
        self.pipeline.stats()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }
}
