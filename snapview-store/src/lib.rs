//! # snapview-store: Materialized collection views
//!
//! Folds a sequenced stream of projection events into per-collection
//! keyed record stores and serves consistent snapshots of them.
//!
//! ## Architecture
//!
//! ```text
//! event transport                                   snapshot consumers
//!       │                                                  ▲
//!       ▼                                                  │ chunks (≤100)
//! ┌──────────────┐    ┌───────────────────┐    ┌───────────┴──────┐
//! │IngestPipeline│──► │ProjectionApplier  │    │SnapshotStreamer  │
//! │ack after     │    │collection → store │    │view + watermark  │
//! │commit        │    └─────────┬─────────┘    └───────────┬──────┘
//! └──────────────┘              │                          │
//!                               ▼                          ▼
//!                     ┌───────────────────────────────────────────┐
//!                     │ CollectionRegistry                        │
//!                     │   users  → RecordStore (RocksDB)          │
//!                     │   orders → RecordStore (RocksDB)          │
//!                     └───────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`projection`]: Projection events, key derivation, field merging
//! - [`storage`]: Per-collection RocksDB stores and their registry
//! - [`applier`]: Applies one projection at one sequence
//! - [`streamer`]: Chunked point-in-time snapshots
//! - [`ingest`]: Transport-facing pipeline with ack/nack

pub mod projection;
pub mod storage;
pub mod applier;
pub mod streamer;
pub mod ingest;

// Re-exports for convenience
pub use projection::{derive_key, DecodeError, Field, Method, Projection, Record, RECORD_PREFIX};
pub use storage::{
    CollectionRegistry, OpenError, RecordStore, RegistryConfig, SnapshotView,
    StoreConfig, StoreError, WATERMARK_KEY,
};
pub use applier::{ApplyError, ProjectionApplier};
pub use streamer::{
    ChannelSink, ChunkSink, SinkError, SnapshotChunk, SnapshotStreamer, StreamError,
    StreamSummary, DEFAULT_CHUNK_SIZE,
};
pub use ingest::{Delivery, Disposition, IngestError, IngestPipeline, IngestStats, Outcome};
