//! Machine identity gate: whether this machine may sync, and delayed
//! de-registration.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use usersync_common::{Machine, MachineId, Manifest, Result};
use usersync_storage::KeyValueStore;

use crate::enablement::EnablementPolicy;
use crate::services::AccountService;
use crate::session::keys;

/// Registry of machines syncing with the remote store.
#[async_trait]
pub trait MachinesRegistry: Send + Sync {
    /// List registered machines, scoped to `manifest` when given.
    async fn get_machines(&self, manifest: Option<&Manifest>) -> Result<Vec<Machine>>;

    /// Register this installation.
    async fn add_current_machine(&self, manifest: Option<&Manifest>) -> Result<()>;

    /// De-register this installation.
    async fn remove_current_machine(&self) -> Result<()>;

    /// Enable or disable sync for a machine.
    async fn set_enablement(&self, id: &MachineId, enabled: bool) -> Result<()>;

    async fn rename_machine(&self, id: &MachineId, name: &str) -> Result<()>;
}

/// Standing of this installation in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStanding {
    /// No record for this installation yet.
    Unregistered,
    /// Registered and allowed to sync.
    Active,
    /// Registered but disabled from another machine.
    Disabled,
}

impl MachineStanding {
    /// Find the record matching `current` in `machines`.
    pub fn of(current: &MachineId, machines: &[Machine]) -> Self {
        match machines.iter().find(|machine| machine.id == *current) {
            None => MachineStanding::Unregistered,
            Some(machine) if machine.disabled => MachineStanding::Disabled,
            Some(_) => MachineStanding::Active,
        }
    }
}

struct PendingRemoval {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Gates sync on this machine's registration and owns the delayed,
/// cancellable removal of the machine.
pub struct MachineIdentityGate {
    machine_id: MachineId,
    registry: Arc<dyn MachinesRegistry>,
    storage: Arc<dyn KeyValueStore>,
    enablement: Arc<EnablementPolicy>,
    accounts: Arc<dyn AccountService>,
    removal_delay: Duration,
    pending: Mutex<Option<PendingRemoval>>,
}

impl MachineIdentityGate {
    pub fn new(
        machine_id: MachineId,
        registry: Arc<dyn MachinesRegistry>,
        storage: Arc<dyn KeyValueStore>,
        enablement: Arc<EnablementPolicy>,
        accounts: Arc<dyn AccountService>,
        removal_delay: Duration,
    ) -> Self {
        Self {
            machine_id,
            registry,
            storage,
            enablement,
            accounts,
            removal_delay,
            pending: Mutex::new(None),
        }
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// Look up this machine's standing in the registry.
    pub async fn standing(&self, manifest: Option<&Manifest>) -> Result<MachineStanding> {
        let machines = self.registry.get_machines(manifest).await?;
        Ok(MachineStanding::of(&self.machine_id, &machines))
    }

    /// Register this machine after its first successful sync.
    pub async fn register(&self, manifest: Option<&Manifest>) -> Result<()> {
        info!("Registering machine {}", self.machine_id);
        self.registry.add_current_machine(manifest).await
    }

    /// De-register this machine right away.
    pub async fn remove(&self) -> Result<()> {
        info!("Removing machine {}", self.machine_id);
        self.registry.remove_current_machine().await
    }

    /// Whether a delayed removal is persisted.
    pub fn has_pending_removal(&self) -> bool {
        self.storage
            .get_bool(keys::DISABLE_MACHINE_EVENTUALLY)
            .unwrap_or(false)
    }

    /// Persist the intent to remove this machine and remove it after the
    /// configured delay, unless cancelled meanwhile.
    ///
    /// At most one delayed removal is armed per process.
    pub fn disable_machine_eventually(&self) -> Result<()> {
        self.storage.set_bool(keys::DISABLE_MACHINE_EVENTUALLY, true)?;
        self.arm_removal();
        Ok(())
    }

    /// Cancel a pending delayed removal. Idempotent.
    pub fn stop_disable_machine_eventually(&self) -> Result<()> {
        self.storage.remove(keys::DISABLE_MACHINE_EVENTUALLY)?;
        if let Some(pending) = self.take_pending() {
            debug!("Cancelled delayed machine removal");
            pending.cancel.cancel();
        }
        Ok(())
    }

    /// Resume a delayed removal persisted by an earlier process.
    pub fn resume_pending_removal(&self) {
        if self.has_pending_removal() {
            info!("Resuming delayed machine removal");
            self.arm_removal();
        }
    }

    /// Stop waiting without clearing the persisted intent, so the removal
    /// resumes at the next start.
    pub fn suspend(&self) {
        if let Some(pending) = self.take_pending() {
            pending.cancel.cancel();
        }
    }

    fn take_pending(&self) -> Option<PendingRemoval> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn arm_removal(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending
            .as_ref()
            .is_some_and(|existing| !existing.handle.is_finished())
        {
            debug!("Delayed machine removal already armed");
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let delay = self.removal_delay;
        let registry = self.registry.clone();
        let storage = self.storage.clone();
        let enablement = self.enablement.clone();
        let accounts = self.accounts.clone();

        info!("Machine will be removed in {:?} unless sync is turned on", delay);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }

            // Cleared by another window or process meanwhile.
            if !storage
                .get_bool(keys::DISABLE_MACHINE_EVENTUALLY)
                .unwrap_or(false)
            {
                return;
            }
            if let Err(e) = storage.remove(keys::DISABLE_MACHINE_EVENTUALLY) {
                warn!("Failed to clear delayed removal flag: {}", e);
            }

            if !enablement.is_enabled() && accounts.has_account() {
                info!("Removing machine after delayed turn-off");
                if let Err(e) = registry.remove_current_machine().await {
                    error!("Delayed machine removal failed: {}", e);
                }
            }
        });

        *pending = Some(PendingRemoval { cancel, handle });
    }
}

impl Drop for MachineIdentityGate {
    fn drop(&mut self) {
        self.suspend();
    }
}
