//! Collection registry: collection name → open record store.
//!
//! Stores are opened lazily under `<data_dir>/<collection>` and stay open
//! for the life of the registry. Each name owns a slot with its own lock,
//! so opening one collection never waits on another, and two callers racing
//! on the same new name end up sharing one handle.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use super::record_store::{RecordStore, StoreConfig, StoreError};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base directory, one database directory per collection
    pub data_dir: PathBuf,
    /// Template for per-collection stores (`path` is replaced)
    pub store: StoreConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("snapview_data"),
            store: StoreConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            store: StoreConfig::for_testing(&data_dir),
            data_dir,
        }
    }
}

/// Errors opening a collection store.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("Invalid collection name: {0:?}")]
    InvalidName(String),
    #[error("Failed to open collection '{collection}': {source}")]
    Storage {
        collection: String,
        #[source]
        source: StoreError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Registry lock poisoned")]
    LockPoisoned,
}

type Slot = Arc<Mutex<Option<Arc<RecordStore>>>>;

/// Process-wide set of open collection stores.
pub struct CollectionRegistry {
    config: RegistryConfig,
    slots: RwLock<HashMap<String, Slot>>,
}

impl CollectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Return the store for `name`, opening (and creating) it on first use.
    pub fn get_or_open(&self, name: &str) -> Result<Arc<RecordStore>, OpenError> {
        validate_name(name)?;
        let slot = self.slot(name)?;

        let mut guard = slot.lock().map_err(|_| OpenError::LockPoisoned)?;
        if let Some(store) = guard.as_ref() {
            return Ok(store.clone());
        }

        let store = Arc::new(self.open_store(name)?);
        *guard = Some(store.clone());
        Ok(store)
    }

    /// Return the store for `name` only if the collection already exists,
    /// either open in this process or persisted under the data directory.
    /// Never creates a database. A name that could never be opened is
    /// simply unknown.
    pub fn lookup(&self, name: &str) -> Result<Option<Arc<RecordStore>>, OpenError> {
        if validate_name(name).is_err() {
            return Ok(None);
        }
        if let Some(store) = self.cached(name)? {
            return Ok(Some(store));
        }
        if !is_store_dir(&self.config.data_dir.join(name)) {
            return Ok(None);
        }
        self.get_or_open(name).map(Some)
    }

    /// All known collection names, open or on disk, sorted.
    pub fn collection_names(&self) -> Result<Vec<String>, OpenError> {
        let mut names: BTreeSet<String> = self.open_names()?.into_iter().collect();
        names.extend(self.persisted_names()?);
        Ok(names.into_iter().collect())
    }

    /// Open every collection persisted under the data directory.
    ///
    /// Returns the number of collections opened.
    pub fn open_all(&self) -> Result<usize, OpenError> {
        let names = self.persisted_names()?;
        for name in &names {
            let store = self.get_or_open(name)?;
            match store.watermark() {
                Ok(Some(seq)) => log::info!("Recovered collection '{name}' at sequence {seq}"),
                Ok(None) => log::info!("Recovered collection '{name}' (no watermark)"),
                Err(e) => log::warn!("Recovered collection '{name}' with unreadable watermark: {e}"),
            }
        }
        Ok(names.len())
    }

    /// Flush every open store.
    pub fn flush_all(&self) -> Result<(), StoreError> {
        let stores = self.open_stores().map_err(|_| StoreError::LockPoisoned)?;
        for store in stores {
            store.flush()?;
        }
        Ok(())
    }

    /// Number of stores currently open.
    pub fn open_count(&self) -> usize {
        self.open_stores().map(|stores| stores.len()).unwrap_or(0)
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.config.data_dir
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn slot(&self, name: &str) -> Result<Slot, OpenError> {
        // Fast path: read lock
        {
            let slots = self.slots.read().map_err(|_| OpenError::LockPoisoned)?;
            if let Some(slot) = slots.get(name) {
                return Ok(slot.clone());
            }
        }

        // Slow path: write lock, double-checked
        let mut slots = self.slots.write().map_err(|_| OpenError::LockPoisoned)?;
        Ok(slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone())
    }

    fn cached(&self, name: &str) -> Result<Option<Arc<RecordStore>>, OpenError> {
        let slot = {
            let slots = self.slots.read().map_err(|_| OpenError::LockPoisoned)?;
            match slots.get(name) {
                Some(slot) => slot.clone(),
                None => return Ok(None),
            }
        };
        let guard = slot.lock().map_err(|_| OpenError::LockPoisoned)?;
        Ok(guard.clone())
    }

    fn open_store(&self, name: &str) -> Result<RecordStore, OpenError> {
        fs::create_dir_all(&self.config.data_dir)?;
        let config = StoreConfig {
            path: self.config.data_dir.join(name),
            ..self.config.store.clone()
        };
        let path = config.path.clone();

        let store = RecordStore::open(config).map_err(|source| OpenError::Storage {
            collection: name.to_string(),
            source,
        })?;
        log::info!("Opened collection '{name}' at {}", path.display());
        Ok(store)
    }

    fn open_stores(&self) -> Result<Vec<Arc<RecordStore>>, OpenError> {
        let slots: Vec<Slot> = {
            let slots = self.slots.read().map_err(|_| OpenError::LockPoisoned)?;
            slots.values().cloned().collect()
        };
        let mut stores = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.lock().map_err(|_| OpenError::LockPoisoned)?;
            if let Some(store) = guard.as_ref() {
                stores.push(store.clone());
            }
        }
        Ok(stores)
    }

    fn open_names(&self) -> Result<Vec<String>, OpenError> {
        let slots: Vec<(String, Slot)> = {
            let slots = self.slots.read().map_err(|_| OpenError::LockPoisoned)?;
            slots.iter().map(|(name, slot)| (name.clone(), slot.clone())).collect()
        };
        let mut names = Vec::new();
        for (name, slot) in slots {
            if slot.lock().map_err(|_| OpenError::LockPoisoned)?.is_some() {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn persisted_names(&self) -> Result<Vec<String>, OpenError> {
        let entries = match fs::read_dir(&self.config.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !is_store_dir(&entry.path()) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// A directory holds a database once RocksDB has written its `CURRENT` file.
fn is_store_dir(path: &Path) -> bool {
    path.join("CURRENT").is_file()
}

/// Collection names become directory names.
fn validate_name(name: &str) -> Result<(), OpenError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    if invalid {
        return Err(OpenError::InvalidName(name.to_string()));
    }
    Ok(())
}
