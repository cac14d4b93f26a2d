//! Persistent storage layer for materialized collections.
//!
//! Architecture:
//! ```text
//! ┌────────────────────┐  get_or_open  ┌─────────────────────────────┐
//! │ CollectionRegistry │ ────────────► │ RecordStore (RocksDB)       │
//! │ name → store       │               │ <data_dir>/<collection>/    │
//! └────────────────────┘               │   "seq"        watermark    │
//!                                      │   "key-<json>" records      │
//!                                      └─────────────────────────────┘
//! ```

pub mod record_store;
pub mod registry;

pub use record_store::{
    RawEntry, RecordIter, RecordStore, SnapshotView, StoreConfig, StoreError, WATERMARK_KEY,
};
pub use registry::{CollectionRegistry, OpenError, RegistryConfig};
