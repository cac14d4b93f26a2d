//! RocksDB-backed keyed record store, one database per collection.
//!
//! Key layout:
//! - `seq`       : sequence watermark (u64, little-endian)
//! - `key-<json>`: serialized record (JSON object) per primary value
//!
//! Every mutation is written in the same `WriteBatch` as the watermark, so
//! after a crash the store reflects both or neither.
//!
//! Reads for snapshots go through a RocksDB snapshot, which pins a sequence
//! number inside the engine: writers keep committing while a view is open
//! and the view never observes them.

use rocksdb::{
    BlockBasedOptions, Cache, DBCompressionType, DBWithThreadMode, Direction, IteratorMode,
    Options, SingleThreaded, SnapshotWithThreadMode, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::projection::{merge_fields, Field, Method, Record, RECORD_PREFIX};

/// Reserved key holding the sequence watermark.
pub const WATERMARK_KEY: &[u8] = b"seq";

type Db = DBWithThreadMode<SingleThreaded>;

/// Raw `(key, value)` pair yielded by snapshot iteration.
pub type RawEntry = (Box<[u8]>, Box<[u8]>);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every commit (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Memtable size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("snapview_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying RocksDB read or write failure
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    /// Stored bytes could not be decoded
    #[error("Corrupt value at '{key}': {reason}")]
    Corruption { key: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    fn corruption(key: &[u8], reason: impl ToString) -> Self {
        StoreError::Corruption {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Durable record store for a single collection.
pub struct RecordStore {
    db: Db,
    config: StoreConfig,
    /// Serializes read-modify-write commits.
    write_lock: Mutex<()>,
}

impl RecordStore {
    /// Open the store at the configured path, creating it if missing.
    ///
    /// Fails if another process holds the database lock.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let opts = Self::db_options(&config);
        let db = Db::open(&opts, &config.path)?;

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn db_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_keep_log_file_num(5);
        opts.increase_parallelism(num_cpus());

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Apply one mutation and advance the watermark in a single batch.
    ///
    /// Upserts merge `fields` over the stored record (absent key = new
    /// record). Deletes remove the key. The watermark is never moved
    /// backwards: a replayed older sequence still applies its mutation but
    /// leaves the watermark where it is.
    pub fn apply(
        &self,
        sequence: u64,
        key: &[u8],
        method: Method,
        fields: &[Field],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;

        let watermark = match self.watermark()? {
            Some(current) if current > sequence => {
                log::warn!(
                    "Sequence {sequence} is behind watermark {current} at {}",
                    self.config.path.display()
                );
                current
            }
            _ => sequence,
        };

        let mut batch = WriteBatch::default();
        batch.put(WATERMARK_KEY, watermark.to_le_bytes());

        match method {
            Method::Delete => batch.delete(key),
            Method::Upsert => {
                let mut record = match self.db.get(key)? {
                    Some(bytes) => decode_record(key, &bytes)?,
                    None => Record::new(),
                };
                merge_fields(&mut record, fields);
                batch.put(key, serde_json::to_vec(&record)?);
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Stored watermark, or `None` if nothing was ever applied.
    pub fn watermark(&self) -> Result<Option<u64>, StoreError> {
        self.db
            .get(WATERMARK_KEY)?
            .map(|bytes| decode_watermark(&bytes))
            .transpose()
    }

    /// Stored watermark, 0 if never set.
    pub fn current_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.watermark()?.unwrap_or(0))
    }

    /// Point read of a single record.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>, StoreError> {
        self.db
            .get(key)?
            .map(|bytes| decode_record(key, &bytes))
            .transpose()
    }

    /// Capture a point-in-time view of records and watermark.
    pub fn open_view(&self) -> SnapshotView<'_> {
        SnapshotView {
            snapshot: self.db.snapshot(),
        }
    }

    /// Number of records, counted through a fresh view.
    pub fn record_count(&self) -> Result<usize, StoreError> {
        let view = self.open_view();
        let mut count = 0;
        for entry in view.records() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

/// Point-in-time read view over one store.
///
/// Released on drop; [`SnapshotView::release`] makes the release explicit.
pub struct SnapshotView<'a> {
    snapshot: SnapshotWithThreadMode<'a, Db>,
}

impl<'a> SnapshotView<'a> {
    /// Watermark as of the view, `None` if never set.
    pub fn watermark(&self) -> Result<Option<u64>, StoreError> {
        self.snapshot
            .get(WATERMARK_KEY)?
            .map(|bytes| decode_watermark(&bytes))
            .transpose()
    }

    /// Watermark as of the view, 0 if never set.
    pub fn sequence(&self) -> Result<u64, StoreError> {
        Ok(self.watermark()?.unwrap_or(0))
    }

    /// Iterate record entries in key order.
    pub fn records(&self) -> RecordIter<'_> {
        let inner = self
            .snapshot
            .iterator(IteratorMode::From(RECORD_PREFIX, Direction::Forward));
        RecordIter {
            inner: Box::new(inner),
            done: false,
        }
    }

    /// Release the view.
    pub fn release(self) {}
}

/// Iterator over the `key-` namespace of a view.
pub struct RecordIter<'a> {
    inner: Box<dyn Iterator<Item = Result<RawEntry, rocksdb::Error>> + 'a>,
    done: bool,
}

impl Iterator for RecordIter<'_> {
    type Item = Result<RawEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok((key, value))) if key.starts_with(RECORD_PREFIX) => Some(Ok((key, value))),
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e.into()))
            }
            // Past the prefix or exhausted.
            _ => {
                self.done = true;
                None
            }
        }
    }
}

fn decode_record(key: &[u8], bytes: &[u8]) -> Result<Record, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::corruption(key, e))
}

fn decode_watermark(bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        StoreError::corruption(
            WATERMARK_KEY,
            format!("expected 8 bytes, found {}", bytes.len()),
        )
    })?;
    Ok(u64::from_le_bytes(raw))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
