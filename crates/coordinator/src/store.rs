//! Shared key/value storage.
//!
//! Every window of a session reads and writes the same store. Keys are
//! namespaced by `(source, user)`; entries can carry a storage version (reads
//! with a different version see nothing) and an expiry time.

use crate::clock::Clock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Layout trees by main id.
pub const LAYOUTS_KEY: &str = "layouts";
/// Liveness record.
pub const LIVENESS_KEY: &str = "rottenWindows";
/// Popouts known to base-main.
pub const POPOUTS_KEY: &str = "popouts";
/// Shared props of base-main.
pub const SHARED_PROPS_KEY: &str = "sharedPropsState";
/// Session token.
pub const SESSION_KEY: &str = "session";
/// User profile.
pub const PROFILE_KEY: &str = "profile";
/// Backup of every layout, written by "save all windows".
pub const LAYOUTS_BACKUP_KEY: &str = "defaultLayouts";

/// Format version of [`LayoutsBackup`].
pub const LAYOUTS_BACKUP_VERSION: u32 = 2;

/// Errors that can occur while accessing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored value could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Namespace of one user of one source application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageScope {
    pub source: String,
    pub user: String,
}

impl StorageScope {
    /// Create a scope.
    pub fn new(source: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            user: user.into(),
        }
    }

    /// Flat key of an entry in this scope.
    pub fn entry_key(&self, key: &str) -> String {
        format!("{}.{}.{}", self.source, self.user, key)
    }
}

/// A stored value with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl StoredEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.map(|at| at <= now_ms).unwrap_or(false)
    }

    fn has_version(&self, version: Option<&str>) -> bool {
        version.is_none() || self.version.as_deref() == version
    }
}

/// Replaces an entry inside [`KvStore::update`]; `None` leaves it untouched.
pub type EntryUpdate<'a> = dyn FnMut(Option<StoredEntry>) -> Option<StoredEntry> + 'a;

/// Raw entry storage.
pub trait KvStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;
    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError>;
    /// Read and replace an entry with no other write to the store in between.
    fn update(&self, key: &str, f: &mut EntryUpdate<'_>) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory store shared by the windows of one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn update(&self, key: &str, f: &mut EntryUpdate<'_>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(entry) = f(entries.get(key).cloned()) {
            entries.insert(key.to_string(), entry);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Store kept in a single JSON file.
///
/// The file is re-read on every access so that separate processes see each
/// other's writes. Writes go to a temp file that is renamed over the store,
/// so readers never see a half-written file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Use the store file at `path`; it is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, StoredEntry>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(json) if json.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &BTreeMap<String, StoredEntry>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &json)?;
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            warn!("Store rename failed ({}), writing in place", e);
            fs::write(&self.path, json)?;
        }
        Ok(())
    }
}

impl KvStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.load()?.remove(key))
    }

    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut entries = self.load()?;
        entries.insert(key.to_string(), entry);
        self.save(&entries)
    }

    fn update(&self, key: &str, f: &mut EntryUpdate<'_>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut entries = self.load()?;
        match f(entries.get(key).cloned()) {
            Some(entry) => {
                entries.insert(key.to_string(), entry);
                self.save(&entries)
            }
            None => Ok(()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.load()?.into_keys().collect())
    }
}

/// Typed access to one scope of a store.
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn KvStore>,
    scope: StorageScope,
    clock: Arc<dyn Clock>,
}

impl Storage {
    pub fn new(store: Arc<dyn KvStore>, scope: StorageScope, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            scope,
            clock,
        }
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    /// Read a raw value; expired entries and other versions read as absent.
    pub fn get_value(&self, key: &str, version: Option<&str>) -> Result<Option<Value>, StoreError> {
        let entry = match self.store.read(&self.scope.entry_key(key))? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if entry.is_expired(self.clock.now_ms()) {
            debug!("Storage entry {} expired", key);
            return Ok(None);
        }
        if !entry.has_version(version) {
            debug!(
                "Storage entry {} has version {:?}, expected {:?}",
                key, entry.version, version
            );
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Read and decode a value.
    pub fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        version: Option<&str>,
    ) -> Result<Option<T>, StoreError> {
        match self.get_value(key, version)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a value, optionally expiring after `ttl`.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        version: Option<&str>,
    ) -> Result<(), StoreError> {
        let entry = StoredEntry {
            value: serde_json::to_value(value)?,
            version: version.map(str::to_string),
            expires_at: ttl.map(|ttl| self.clock.now_ms() + ttl.as_millis() as u64),
        };
        self.store.write(&self.scope.entry_key(key), entry)
    }

    /// Decode, change and write back a value in one step of the store.
    ///
    /// `f` sees the current value (absent when expired or of another
    /// version) and returns the replacement, or `None` to write nothing.
    /// Returns whether a value was written.
    pub fn update<T, F>(&self, key: &str, version: Option<&str>, f: F) -> Result<bool, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let now = self.clock.now_ms();
        let mut f = Some(f);
        let mut failure: Option<StoreError> = None;
        let mut written = false;

        self.store.update(&self.scope.entry_key(key), &mut |entry: Option<StoredEntry>| {
            let f = f.take()?;
            let current = match entry.filter(|e| !e.is_expired(now) && e.has_version(version)) {
                Some(entry) => match serde_json::from_value(entry.value) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        failure = Some(e.into());
                        return None;
                    }
                },
                None => None,
            };
            let next = f(current)?;
            match serde_json::to_value(&next) {
                Ok(value) => {
                    written = true;
                    Some(StoredEntry {
                        value,
                        version: version.map(str::to_string),
                        expires_at: None,
                    })
                }
                Err(e) => {
                    failure = Some(e.into());
                    None
                }
            }
        })?;

        match failure {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Remove a value.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(&self.scope.entry_key(key))
    }

    /// Persisted layout trees by main id; unreadable data reads as empty.
    pub fn layouts(&self, version: &str) -> LayoutsMap {
        match self.get::<LayoutsMap>(LAYOUTS_KEY, Some(version)) {
            Ok(layouts) => layouts.unwrap_or_default(),
            Err(e) => {
                warn!("Failed to read persisted layouts: {}", e);
                LayoutsMap::new()
            }
        }
    }

    /// Replace the persisted layout trees.
    pub fn set_layouts(&self, layouts: &LayoutsMap, version: &str) -> Result<(), StoreError> {
        self.set(LAYOUTS_KEY, layouts, None, Some(version))
    }
}

/// Layout tree JSON by main id.
pub type LayoutsMap = BTreeMap<String, Value>;

/// Snapshot of every layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutsBackup {
    pub updated_at: u64,
    #[serde(default)]
    pub uploaded_at: u64,
    pub version: u32,
    #[serde(default)]
    pub layouts: LayoutsMap,
}

/// Profile of the signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub default_room_id: String,
}
