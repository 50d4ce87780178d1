//! Common types used throughout usersync.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of this installation as known to the machines registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(String);

impl MachineId {
    /// Create a new MachineId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "MachineId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A category of user data kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncResource {
    Settings,
    Keybindings,
    Snippets,
    Tasks,
    Extensions,
    GlobalState,
}

impl SyncResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResource::Settings => "settings",
            SyncResource::Keybindings => "keybindings",
            SyncResource::Snippets => "snippets",
            SyncResource::Tasks => "tasks",
            SyncResource::Extensions => "extensions",
            SyncResource::GlobalState => "globalState",
        }
    }
}

impl fmt::Display for SyncResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote store manifest: the current session and the latest version of
/// each resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Session identifier of the remote store.
    pub session: String,
    /// Latest known version per resource.
    #[serde(default)]
    pub latest: BTreeMap<SyncResource, String>,
}

impl Manifest {
    /// Create a manifest for a session with no resource versions yet.
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            latest: BTreeMap::new(),
        }
    }

    /// Record the latest version of a resource.
    pub fn with_version(mut self, resource: SyncResource, version: impl Into<String>) -> Self {
        self.latest.insert(resource, version.into());
        self
    }
}

/// A machine registered with the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    /// Set by the registry when the record belongs to this installation.
    pub is_current: bool,
    /// Sync was disabled for this machine from another machine.
    pub disabled: bool,
}
