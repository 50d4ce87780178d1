//! JSON file backed key-value store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use usersync_common::{Error, Result};
use crate::store::{KeyValueStore, StorageChange, CHANGE_CHANNEL_CAPACITY};

/// Key-value store persisted as a single JSON object on disk.
///
/// Every process of an installation points at the same file. Writes replace
/// the file atomically; [`FileStore::reload`] picks up writes made by other
/// processes and reports them as external changes.
pub struct FileStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl FileStore {
    /// Open the store at `path`.
    ///
    /// # Postconditions
    /// - Parent directories are created if they don't exist
    /// - Existing values are loaded; a missing file is an empty store
    ///
    /// # Errors
    /// - Permission denied
    /// - File exists but is not a JSON object of strings
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let values = Self::read_file(&path)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            path,
            values: RwLock::new(values),
            changes,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the backing file and broadcast an external change for every
    /// key whose value differs from what this instance had.
    ///
    /// Returns the changed keys.
    pub fn reload(&self) -> Result<Vec<String>> {
        let fresh = Self::read_file(&self.path)?;
        let changed: Vec<String> = {
            let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
            let keys: BTreeSet<&String> = values.keys().chain(fresh.keys()).collect();
            let changed = keys
                .into_iter()
                .filter(|key| values.get(*key) != fresh.get(*key))
                .cloned()
                .collect();
            *values = fresh;
            changed
        };

        for key in &changed {
            debug!("External storage change: {}", key);
            let _ = self.changes.send(StorageChange::external(key.clone()));
        }

        Ok(changed)
    }

    fn read_file(path: &Path) -> Result<BTreeMap<String, String>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            Error::Serialization(format!("Invalid store file {}: {}", path.display(), e))
        })
    }

    fn write_file(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(values)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let tmp = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::Storage(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            )));
        }
        Ok(())
    }

    /// Apply a write and persist it, returning whether the value changed.
    fn update(&self, key: &str, value: Option<&str>) -> Result<bool> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        if values.get(key).map(String::as_str) == value {
            return Ok(false);
        }

        let mut next = values.clone();
        match value {
            Some(value) => {
                next.insert(key.to_string(), value.to_string());
            }
            None => {
                next.remove(key);
            }
        }

        self.write_file(&next)?;
        *values = next;
        Ok(true)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.update(key, Some(value))? {
            let _ = self.changes.send(StorageChange::local(key));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.update(key, None)? {
            let _ = self.changes.send(StorageChange::local(key));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
