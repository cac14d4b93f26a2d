//! # snapview-server: WebSocket front end for snapview
//!
//! Serves collection snapshots and watermarks to consumers and feeds
//! published projections into the ingestion pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket      ┌────────────────┐
//! │ SnapshotClient │ ◄────────────────► │ SnapshotServer │
//! │ (consumer)     │    Binary Proto    │                │
//! └────────────────┘                    └───────┬────────┘
//!                                               │
//!                                 ┌─────────────┴─────────────┐
//!                                 ▼                           ▼
//!                        ┌──────────────────┐       ┌──────────────────┐
//!                        │ SnapshotStreamer │       │ IngestPipeline   │
//!                        └────────┬─────────┘       └────────┬─────────┘
//!                                 │                          │
//!                                 ▼                          ▼
//!                        ┌─────────────────────────────────────────────┐
//!                        │ CollectionRegistry (one RocksDB per name)   │
//!                        └─────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded RpcMessage)
//! - [`server`]: WebSocket snapshot server
//! - [`client`]: WebSocket snapshot client

pub mod protocol;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{MessageType, ProtocolError, RpcMessage};
pub use server::{ServerConfig, ServerStats, SnapshotServer};
pub use client::{Snapshot, SnapshotClient, DEFAULT_REPLY_TIMEOUT};
