//! Shared widget state store
//!
//! The widget surfaces and the host application share a small key/value
//! mapping. The command core only writes `locked`, `scanning` and
//! `scanningStartTime`; every other key is owned by someone else and is read
//! here at most.

use crate::{now_ms, VehicleIdentity};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Keys of the shared widget state
pub mod keys {
    /// Identifier of the paired scooter (written by the pairing flow)
    pub const LAST_CONNECTED_SCOOTER_ID: &str = "lastConnectedScooterId";
    /// Display name of the paired scooter
    pub const SCOOTER_NAME: &str = "scooterName";
    /// Last known lock state
    pub const LOCKED: &str = "locked";
    /// A command is in flight
    pub const SCANNING: &str = "scanning";
    /// When `scanning` was last set, ms since epoch
    pub const SCANNING_START_TIME: &str = "scanningStartTime";
    pub const STATE_NAME: &str = "stateName";
    pub const SOC1: &str = "soc1";
    pub const SOC2: &str = "soc2";
    pub const LAST_LAT: &str = "lastLat";
    pub const LAST_LON: &str = "lastLon";
}

/// Primitive value stored under a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
}

impl StoreValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StoreValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StoreValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers are widened, platform stores do not always keep the distinction
    pub fn as_double(&self) -> Option<f64> {
        match self {
            StoreValue::Double(d) => Some(*d),
            StoreValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StoreValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for StoreValue {
    fn from(value: bool) -> Self {
        StoreValue::Bool(value)
    }
}

impl From<i64> for StoreValue {
    fn from(value: i64) -> Self {
        StoreValue::Int(value)
    }
}

impl From<f64> for StoreValue {
    fn from(value: f64) -> Self {
        StoreValue::Double(value)
    }
}

impl From<&str> for StoreValue {
    fn from(value: &str) -> Self {
        StoreValue::Text(value.to_string())
    }
}

/// Errors that can occur while accessing a store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Store file {path} is not a JSON object: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value mapping shared with the presentation surfaces
pub trait SharedStateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError>;

    fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Make pending writes visible to other processes
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory store, used when no persisted store is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, StoreValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with values
    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, StoreValue)>,
        K: Into<String>,
    {
        let store = Self::new();
        if let Ok(mut map) = store.values.lock() {
            map.extend(values.into_iter().map(|(k, v)| (k.into(), v)));
        }
        store
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoreValue>> {
        // A poisoned map still holds consistent primitive values
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SharedStateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        Ok(self.map().get(key).cloned())
    }

    fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        self.map().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.map().remove(key);
        Ok(())
    }
}

/// Store persisted as one JSON object on disk.
///
/// Other processes write the same file. Every access re-reads it under an
/// advisory lock on a sibling `.lock` file, shared for reads and exclusive
/// for read-modify-write. Writes go to a unique temp file that replaces the
/// store atomically.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        Self {
            lock_path: path.with_file_name(lock_name),
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Open the lock file and take the advisory lock. Released when the
    /// returned handle is dropped.
    fn acquire(&self, exclusive: bool) -> Result<File, StoreError> {
        if exclusive {
            fs::create_dir_all(self.dir()).map_err(|e| self.io_err(e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| self.io_err(e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| self.io_err(e))?;
        Ok(file)
    }

    fn load(&self) -> Result<BTreeMap<String, StoreValue>, StoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }

        serde_json::from_slice(&data).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, values: &BTreeMap<String, StoreValue>) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(values).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(|e| self.io_err(e))?;
        tmp.write_all(&data).map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path)
            .map(|_| ())
            .map_err(|e| self.io_err(e.error))
    }

    fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, StoreValue>),
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _file_lock = self.acquire(true)?;
        let mut values = self.load()?;
        f(&mut values);
        self.save(&values)
    }
}

impl SharedStateStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _file_lock = match self.acquire(false) {
            Ok(file) => file,
            // Nothing has been written yet
            Err(StoreError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        self.update(|values| {
            values.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Typed view over the shared widget state.
///
/// Reads never fail: store errors are logged and reported as absent values,
/// defaults are applied by the caller.
#[derive(Clone)]
pub struct WidgetState {
    store: Arc<dyn SharedStateStore>,
}

impl WidgetState {
    pub fn new(store: Arc<dyn SharedStateStore>) -> Self {
        Self { store }
    }

    fn read(&self, key: &str) -> Option<StoreValue> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("[STORE] Failed to read {}: {}", key, e);
                None
            }
        }
    }

    fn write(&self, key: &str, value: StoreValue) {
        if let Err(e) = self.store.set(key, value) {
            warn!("[STORE] Failed to write {}: {}", key, e);
        }
    }

    fn read_text(&self, key: &str) -> Option<String> {
        self.read(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty())
    }

    /// The paired scooter, if the pairing flow has stored one
    pub fn vehicle_identity(&self) -> Option<VehicleIdentity> {
        let id = self.read_text(keys::LAST_CONNECTED_SCOOTER_ID)?;
        Some(VehicleIdentity {
            id,
            name: self.read_text(keys::SCOOTER_NAME),
        })
    }

    pub fn locked(&self) -> Option<bool> {
        self.read(keys::LOCKED).and_then(|v| v.as_bool())
    }

    pub fn scanning(&self) -> Option<bool> {
        self.read(keys::SCANNING).and_then(|v| v.as_bool())
    }

    pub fn scanning_started_at(&self) -> Option<i64> {
        self.read(keys::SCANNING_START_TIME).and_then(|v| v.as_int())
    }

    pub fn state_name(&self) -> Option<String> {
        self.read_text(keys::STATE_NAME)
    }

    /// Battery levels of the primary and secondary slot
    pub fn battery_levels(&self) -> (Option<i64>, Option<i64>) {
        (
            self.read(keys::SOC1).and_then(|v| v.as_int()),
            self.read(keys::SOC2).and_then(|v| v.as_int()),
        )
    }

    pub fn last_location(&self) -> Option<(f64, f64)> {
        let lat = self.read(keys::LAST_LAT)?.as_double()?;
        let lon = self.read(keys::LAST_LON)?.as_double()?;
        Some((lat, lon))
    }

    /// Mark a command as in flight
    pub fn begin_scanning(&self) {
        self.write(keys::SCANNING, StoreValue::Bool(true));
        self.write(keys::SCANNING_START_TIME, StoreValue::Int(now_ms() as i64));
        self.flush();
        debug!("[STORE] scanning=true");
    }

    /// Clear the in-flight marker, optionally recording the new lock state
    pub fn end_scanning(&self, locked: Option<bool>) {
        if let Some(locked) = locked {
            self.write(keys::LOCKED, StoreValue::Bool(locked));
        }
        self.write(keys::SCANNING, StoreValue::Bool(false));
        if let Err(e) = self.store.remove(keys::SCANNING_START_TIME) {
            warn!("[STORE] Failed to clear {}: {}", keys::SCANNING_START_TIME, e);
        }
        self.flush();
        debug!("[STORE] scanning=false locked={:?}", locked);
    }

    fn flush(&self) {
        if let Err(e) = self.store.flush() {
            warn!("[STORE] Failed to flush: {}", e);
        }
    }
}
