//! In-memory key-value store for testing.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

use usersync_common::Result;
use crate::store::{KeyValueStore, StorageChange, CHANGE_CHANNEL_CAPACITY};

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Apply a write made by another process sharing this storage.
    ///
    /// `None` removes the key. Subscribers see an external change if the
    /// value differs from the current one.
    pub fn apply_external(&self, key: &str, value: Option<&str>) {
        if self.write(key, value.map(str::to_string)) {
            let _ = self.changes.send(StorageChange::external(key));
        }
    }

    /// Write a value, returning whether it changed.
    fn write(&self, key: &str, value: Option<String>) -> bool {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(value) => {
                if values.get(key) == Some(&value) {
                    return false;
                }
                values.insert(key.to_string(), value);
                true
            }
            None => values.remove(key).is_some(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.write(key, Some(value.to_string())) {
            let _ = self.changes.send(StorageChange::local(key));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.write(key, None) {
            let _ = self.changes.send(StorageChange::local(key));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
