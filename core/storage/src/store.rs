//! Key-value store trait definition.

use tokio::sync::broadcast;

use usersync_common::Result;

/// Capacity of the change notification channel of each store.
pub const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Where a change to the store originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written through this store instance.
    Local,
    /// Written by another process or window sharing the same storage.
    External,
}

/// Notification that the value under `key` changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub origin: ChangeOrigin,
}

impl StorageChange {
    pub fn local(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            origin: ChangeOrigin::Local,
        }
    }

    pub fn external(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            origin: ChangeOrigin::External,
        }
    }
}

/// Globally scoped persisted key-value storage.
///
/// Reads are synchronous and served from memory; implementations decide
/// how and when values reach durable storage.
pub trait KeyValueStore: Send + Sync {
    /// Get the raw value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`.
    ///
    /// # Postconditions
    /// - A [`StorageChange`] is broadcast if the stored value changed
    ///
    /// # Errors
    /// - Backend write failure
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the value under `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;

    /// Get a boolean value. Values that do not parse are treated as missing.
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|value| value.parse().ok())
    }

    /// Store a boolean value.
    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" })
    }
}
