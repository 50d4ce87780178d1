//! Collaborator interfaces consumed by the auto-sync coordinator.
//!
//! The coordinator never talks to the network or renders anything itself.
//! Content synchronization, account management and the remote store's
//! throttling signals are provided through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

use usersync_common::{MachineId, Manifest, Result, SyncResource};
use usersync_storage::KeyValueStore;

use crate::machines::MachinesRegistry;

/// A single content synchronization pass prepared by the [`SyncService`].
#[async_trait]
pub trait SyncTask: Send + Sync {
    /// Remote manifest observed when the task was created, if a remote
    /// session exists.
    fn manifest(&self) -> Option<&Manifest>;

    /// Diff, merge and apply user data against the remote store.
    async fn run(&self) -> Result<()>;

    /// Ask a running pass to stop as soon as possible.
    async fn stop(&self) -> Result<()>;
}

/// Produces sync tasks and owns local sync state.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Prepare a new pass against the remote store.
    async fn create_sync_task(&self) -> Result<Arc<dyn SyncTask>>;

    /// Fetch the current remote manifest.
    async fn fetch_manifest(&self) -> Result<Option<Manifest>>;

    /// Whether this installation has ever completed a successful sync.
    async fn has_previously_synced(&self) -> Result<bool>;

    /// Forget local sync state (last synced versions, caches).
    async fn reset_local(&self) -> Result<()>;

    /// Delete all data from the remote store and reset local state.
    async fn reset_remote(&self) -> Result<()>;

    /// Local user data changed; the payload is the source tag.
    fn subscribe_local_changes(&self) -> broadcast::Receiver<String>;
}

/// Account/credential availability.
pub trait AccountService: Send + Sync {
    fn has_account(&self) -> bool;

    /// Fires when the account changes.
    fn subscribe(&self) -> broadcast::Receiver<()>;
}

/// Throttling signal published by the remote store.
pub trait SyncStoreSignal: Send + Sync {
    /// The store asked not to be contacted before this instant.
    fn donot_make_requests_until(&self) -> Option<DateTime<Utc>>;

    /// Fires when the throttling window changes.
    fn subscribe(&self) -> broadcast::Receiver<()>;
}

/// Per-resource enablement chosen by the user.
pub trait ResourceEnablement: Send + Sync {
    /// Fires with the resource and its new enablement.
    fn subscribe(&self) -> broadcast::Receiver<(SyncResource, bool)>;
}

/// Everything the coordinator needs from its surroundings.
#[derive(Clone)]
pub struct SyncContext {
    /// Identity of this installation.
    pub machine_id: MachineId,
    pub sync: Arc<dyn SyncService>,
    pub accounts: Arc<dyn AccountService>,
    pub store_signal: Arc<dyn SyncStoreSignal>,
    pub machines: Arc<dyn MachinesRegistry>,
    pub resources: Arc<dyn ResourceEnablement>,
    /// Globally scoped persisted storage.
    pub storage: Arc<dyn KeyValueStore>,
}
