//! Record persistence
//!
//! All records share one JSON object stored in a single slot:
//!
//! ```json
//! { "<owner>/<tree name>": { "hash": "<hex>", "key": "<hex>", "visibility": "private",
//!                            "updatedAt": 1700000000, "source": "local-write", "dirty": true,
//!                            "selfEncryptedKey": "..." } }
//! ```
//!
//! Entries that fail to parse are skipped with a warning so one corrupt
//! record never prevents the rest from loading.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use hashtree_core::{from_hex, key_from_hex, key_to_hex, to_hex, TreeVisibility};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::record::{KeyEnvelope, RecordState, RootSource, TreeKey, TreeRootRecord};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

pub trait RootPersistence: Send + Sync {
    fn save(&self, key: &TreeKey, record: &TreeRootRecord) -> Result<(), PersistenceError>;
    fn load(&self, key: &TreeKey) -> Result<Option<TreeRootRecord>, PersistenceError>;
    fn delete(&self, key: &TreeKey) -> Result<(), PersistenceError>;
    fn load_all(&self) -> Result<BTreeMap<TreeKey, TreeRootRecord>, PersistenceError>;
}

/// One string-valued storage location
pub trait StorageSlot: Send + Sync {
    fn read(&self) -> Result<Option<String>, PersistenceError>;
    fn write(&self, contents: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemorySlot {
    value: Mutex<Option<String>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(contents.into())),
        }
    }

    pub fn contents(&self) -> Option<String> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StorageSlot for MemorySlot {
    fn read(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self.contents())
    }

    fn write(&self, contents: &str) -> Result<(), PersistenceError> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents.to_string());
        Ok(())
    }
}

/// File-backed slot. Writes go to a temp file in the same directory and
/// are renamed over the target, so a crash leaves the old or new contents.
#[derive(Debug, Clone)]
pub struct FileSlot {
    path: PathBuf,
}

impl FileSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageSlot for FileSlot {
    fn read(&self) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, contents: &str) -> Result<(), PersistenceError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerializedRecord {
    hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default)]
    visibility: TreeVisibility,
    updated_at: u64,
    source: RootSource,
    #[serde(default)]
    dirty: bool,
    #[serde(flatten)]
    envelope: KeyEnvelope,
}

impl From<&TreeRootRecord> for SerializedRecord {
    fn from(record: &TreeRootRecord) -> Self {
        Self {
            hash: to_hex(&record.hash),
            key: record.key.as_ref().map(key_to_hex),
            visibility: record.visibility,
            updated_at: record.updated_at(),
            source: record.source(),
            dirty: record.is_dirty(),
            envelope: record.envelope.clone(),
        }
    }
}

impl TryFrom<SerializedRecord> for TreeRootRecord {
    type Error = PersistenceError;

    fn try_from(value: SerializedRecord) -> Result<Self, Self::Error> {
        let hash = from_hex(&value.hash)
            .map_err(|e| PersistenceError::InvalidRecord(format!("hash: {}", e)))?;
        let key = value
            .key
            .as_deref()
            .map(key_from_hex)
            .transpose()
            .map_err(|e| PersistenceError::InvalidRecord(format!("key: {}", e)))?;
        let state = if value.dirty {
            RecordState::Dirty {
                pending_since: value.updated_at,
                retry_count: 0,
            }
        } else {
            RecordState::Clean {
                source: value.source,
                updated_at: value.updated_at,
            }
        };
        Ok(TreeRootRecord {
            hash,
            key,
            visibility: value.visibility,
            envelope: value.envelope,
            state,
        })
    }
}

fn decode_entry(value: &Value) -> Result<TreeRootRecord, PersistenceError> {
    let serialized: SerializedRecord = serde_json::from_value(value.clone())?;
    TreeRootRecord::try_from(serialized)
}

/// [`RootPersistence`] over a single JSON blob
pub struct JsonPersistence<S: StorageSlot> {
    slot: S,
    // serializes read-modify-write of the blob
    lock: Mutex<()>,
}

impl<S: StorageSlot> JsonPersistence<S> {
    pub fn new(slot: S) -> Self {
        Self {
            slot,
            lock: Mutex::new(()),
        }
    }

    pub fn slot(&self) -> &S {
        &self.slot
    }

    fn read_map(&self) -> Result<Map<String, Value>, PersistenceError> {
        let Some(text) = self.slot.read()? else {
            return Ok(Map::new());
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => {
                warn!("persisted tree roots are not a JSON object, starting empty");
                Ok(Map::new())
            }
            Err(e) => {
                warn!("failed to parse persisted tree roots, starting empty: {}", e);
                Ok(Map::new())
            }
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<(), PersistenceError> {
        self.slot.write(&serde_json::to_string(map)?)
    }
}

impl<S: StorageSlot> RootPersistence for JsonPersistence<S> {
    fn save(&self, key: &TreeKey, record: &TreeRootRecord) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        map.insert(
            key.to_string(),
            serde_json::to_value(SerializedRecord::from(record))?,
        );
        self.write_map(&map)
    }

    fn load(&self, key: &TreeKey) -> Result<Option<TreeRootRecord>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let map = self.read_map()?;
        let Some(value) = map.get(&key.to_string()) else {
            return Ok(None);
        };
        match decode_entry(value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("skipping malformed tree root {}: {}", key, e);
                Ok(None)
            }
        }
    }

    fn delete(&self, key: &TreeKey) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        if map.remove(&key.to_string()).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    fn load_all(&self) -> Result<BTreeMap<TreeKey, TreeRootRecord>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let map = self.read_map()?;
        let mut records = BTreeMap::new();
        for (raw_key, value) in &map {
            let key: TreeKey = match raw_key.parse() {
                Ok(key) => key,
                Err(e) => {
                    warn!("skipping persisted tree root: {}", e);
                    continue;
                }
            };
            match decode_entry(value) {
                Ok(record) => {
                    records.insert(key, record);
                }
                Err(e) => warn!("skipping malformed tree root {}: {}", raw_key, e),
            }
        }
        Ok(records)
    }
}
