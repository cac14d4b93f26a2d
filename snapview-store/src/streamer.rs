//! Snapshot streaming: a point-in-time view of one collection, delivered in
//! bounded chunks.
//!
//! ```text
//! RecordStore ── open_view() ──► SnapshotView ── records() ──► chunk (≤100)
//!                                     │                           │
//!                                 watermark ──────────────────────┴──► ChunkSink
//! ```
//!
//! Every chunk of one stream carries the watermark read when the view was
//! opened. The view is released when the stream returns, including when the
//! sink fails part-way through.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::storage::{CollectionRegistry, OpenError, RecordStore, StoreError};

/// Records per chunk unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// One batch of a streamed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub collection: String,
    /// Watermark of the view this chunk was read from
    pub sequence: u64,
    /// Serialized records (JSON objects), in key order
    pub entries: Vec<Vec<u8>>,
}

/// Totals for a completed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub sequence: u64,
    pub chunks: usize,
    pub records: usize,
}

/// Errors raised by a chunk consumer.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Snapshot consumer disconnected")]
    Closed,
    #[error("Snapshot consumer failed: {0}")]
    Failed(String),
}

/// Errors aborting a snapshot stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Collection unavailable: {0}")]
    Open(#[from] OpenError),
    #[error("Snapshot read failed: {0}")]
    Store(#[from] StoreError),
    #[error("Snapshot delivery failed: {0}")]
    Sink(#[from] SinkError),
}

/// Consumer of snapshot chunks.
pub trait ChunkSink {
    fn send(&mut self, chunk: SnapshotChunk) -> Result<(), SinkError>;
}

impl ChunkSink for Vec<SnapshotChunk> {
    fn send(&mut self, chunk: SnapshotChunk) -> Result<(), SinkError> {
        self.push(chunk);
        Ok(())
    }
}

/// Forwards chunks into a bounded tokio channel.
///
/// Blocks while the channel is full, so it must run off the async runtime
/// (e.g. inside `spawn_blocking`). Fails once the receiver is dropped.
pub struct ChannelSink {
    tx: mpsc::Sender<SnapshotChunk>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<SnapshotChunk>) -> Self {
        Self { tx }
    }
}

impl ChunkSink for ChannelSink {
    fn send(&mut self, chunk: SnapshotChunk) -> Result<(), SinkError> {
        self.tx.blocking_send(chunk).map_err(|_| SinkError::Closed)
    }
}

/// Streams collection snapshots out of a registry.
pub struct SnapshotStreamer {
    registry: Arc<CollectionRegistry>,
    chunk_size: usize,
}

impl SnapshotStreamer {
    pub fn new(registry: Arc<CollectionRegistry>) -> Self {
        Self {
            registry,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the chunk capacity (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stream `collection` into `sink`.
    ///
    /// An unknown collection produces no chunks and a zero summary.
    pub fn stream<S>(&self, collection: &str, sink: &mut S) -> Result<StreamSummary, StreamError>
    where
        S: ChunkSink + ?Sized,
    {
        match self.registry.lookup(collection)? {
            Some(store) => self.stream_store(collection, &store, sink),
            None => {
                log::debug!("Snapshot of unknown collection '{collection}' is empty");
                Ok(StreamSummary::default())
            }
        }
    }

    /// Stream an already resolved store.
    pub fn stream_store<S>(
        &self,
        collection: &str,
        store: &RecordStore,
        sink: &mut S,
    ) -> Result<StreamSummary, StreamError>
    where
        S: ChunkSink + ?Sized,
    {
        let view = store.open_view();
        let sequence = view.sequence()?;
        let mut summary = StreamSummary {
            sequence,
            ..StreamSummary::default()
        };

        let mut entries = Vec::with_capacity(self.chunk_size);
        for entry in view.records() {
            let (_, value) = entry?;
            entries.push(value.into_vec());
            if entries.len() == self.chunk_size {
                let full = std::mem::replace(&mut entries, Vec::with_capacity(self.chunk_size));
                Self::emit(collection, sequence, full, sink, &mut summary)?;
            }
        }
        if !entries.is_empty() {
            Self::emit(collection, sequence, entries, sink, &mut summary)?;
        }
        view.release();

        log::debug!(
            "Streamed {} records in {} chunks from '{collection}' at sequence {sequence}",
            summary.records,
            summary.chunks
        );
        Ok(summary)
    }

    /// Watermark of `collection`, `None` if it is unknown or never written.
    pub fn state(&self, collection: &str) -> Result<Option<u64>, StreamError> {
        match self.registry.lookup(collection)? {
            Some(store) => Ok(store.watermark()?),
            None => Ok(None),
        }
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    fn emit<S>(
        collection: &str,
        sequence: u64,
        entries: Vec<Vec<u8>>,
        sink: &mut S,
        summary: &mut StreamSummary,
    ) -> Result<(), SinkError>
    where
        S: ChunkSink + ?Sized,
    {
        let count = entries.len();
        sink.send(SnapshotChunk {
            collection: collection.to_string(),
            sequence,
            entries,
        })?;
        summary.chunks += 1;
        summary.records += count;
        Ok(())
    }
}
