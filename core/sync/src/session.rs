//! Persisted session tracking.

use std::sync::Arc;

use usersync_common::{Manifest, Result};
use usersync_storage::KeyValueStore;

/// Storage keys owned by the auto-sync coordinator.
pub mod keys {
    /// User preference for auto-sync.
    pub const ENABLEMENT: &str = "sync.enable";
    /// Remote session id recorded after the last successful pass.
    pub const SESSION_ID: &str = "sync.sessionId";
    /// A delayed removal of this machine is pending.
    pub const DISABLE_MACHINE_EVENTUALLY: &str = "sync.disableMachineEventually";
}

/// Local record of the remote session next to the manifest a pass observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSession {
    /// Last known good remote session id.
    pub session_id: Option<String>,
    /// Manifest observed by the current pass.
    pub manifest: Option<Manifest>,
}

impl SyncSession {
    /// The remote session changed since the last successful pass.
    pub fn is_expired(&self) -> bool {
        match (&self.session_id, &self.manifest) {
            (Some(session_id), Some(manifest)) => manifest.session != *session_id,
            _ => false,
        }
    }

    /// Whether `latest` carries a session different from the recorded one.
    pub fn needs_update(&self, latest: &Manifest) -> bool {
        self.session_id.as_deref() != Some(latest.session.as_str())
    }
}

/// Reads and writes the recorded session id.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    pub fn session_id(&self) -> Option<String> {
        self.storage.get(keys::SESSION_ID)
    }

    /// Snapshot the recorded session against a freshly observed manifest.
    pub fn observe(&self, manifest: Option<&Manifest>) -> SyncSession {
        SyncSession {
            session_id: self.session_id(),
            manifest: manifest.cloned(),
        }
    }

    pub fn set_session_id(&self, session_id: &str) -> Result<()> {
        self.storage.set(keys::SESSION_ID, session_id)
    }

    pub fn clear(&self) -> Result<()> {
        self.storage.remove(keys::SESSION_ID)
    }
}
