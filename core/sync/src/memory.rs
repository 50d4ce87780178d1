//! In-memory collaborators for testing and simulation.
//!
//! Each type stands in for one external service the coordinator consumes
//! and records the calls it receives so tests can assert on them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use usersync_common::{Error, Machine, MachineId, Manifest, Result, SyncError, SyncResource};
use usersync_storage::KeyValueStore;

use crate::machines::MachinesRegistry;
use crate::services::{
    AccountService, ResourceEnablement, SyncContext, SyncService, SyncStoreSignal, SyncTask,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct SyncServiceState {
    remote_manifest: Option<Manifest>,
    previously_synced: bool,
    failures: VecDeque<SyncError>,
    run_delay: Duration,
    tasks_created: usize,
    runs_started: usize,
    runs_completed: usize,
    in_flight: usize,
    max_in_flight: usize,
    stops: usize,
    local_resets: usize,
    remote_resets: usize,
}

struct SyncShared {
    state: Mutex<SyncServiceState>,
    local_changes: broadcast::Sender<String>,
}

/// Sync service backed by an in-memory "remote" manifest.
///
/// A successful run creates a remote session if none exists and marks the
/// installation as previously synced. Failures queued with
/// [`MemorySyncService::fail_next_run`] are returned by subsequent runs.
#[derive(Clone)]
pub struct MemorySyncService {
    shared: Arc<SyncShared>,
}

impl MemorySyncService {
    pub fn new() -> Self {
        let (local_changes, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(SyncShared {
                state: Mutex::new(SyncServiceState::default()),
                local_changes,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SyncServiceState> {
        lock(&self.shared.state)
    }

    pub fn set_remote_manifest(&self, manifest: Option<Manifest>) {
        self.state().remote_manifest = manifest;
    }

    pub fn remote_manifest(&self) -> Option<Manifest> {
        self.state().remote_manifest.clone()
    }

    pub fn set_previously_synced(&self, synced: bool) {
        self.state().previously_synced = synced;
    }

    /// Make the next run fail with `error`.
    pub fn fail_next_run(&self, error: SyncError) {
        self.state().failures.push_back(error);
    }

    /// Simulated network time of each run.
    pub fn set_run_delay(&self, delay: Duration) {
        self.state().run_delay = delay;
    }

    /// Announce a local data change.
    pub fn notify_local_change(&self, source: impl Into<String>) {
        let _ = self.shared.local_changes.send(source.into());
    }

    pub fn tasks_created(&self) -> usize {
        self.state().tasks_created
    }

    pub fn runs_started(&self) -> usize {
        self.state().runs_started
    }

    pub fn runs_completed(&self) -> usize {
        self.state().runs_completed
    }

    /// Highest number of runs observed executing at once.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn stops(&self) -> usize {
        self.state().stops
    }

    pub fn local_resets(&self) -> usize {
        self.state().local_resets
    }

    pub fn remote_resets(&self) -> usize {
        self.state().remote_resets
    }
}

impl Default for MemorySyncService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncService for MemorySyncService {
    async fn create_sync_task(&self) -> Result<Arc<dyn SyncTask>> {
        let manifest = {
            let mut state = self.state();
            state.tasks_created += 1;
            state.remote_manifest.clone()
        };
        Ok(Arc::new(MemorySyncTask {
            manifest,
            shared: self.shared.clone(),
            stopped: CancellationToken::new(),
        }))
    }

    async fn fetch_manifest(&self) -> Result<Option<Manifest>> {
        Ok(self.remote_manifest())
    }

    async fn has_previously_synced(&self) -> Result<bool> {
        Ok(self.state().previously_synced)
    }

    async fn reset_local(&self) -> Result<()> {
        let mut state = self.state();
        state.local_resets += 1;
        state.previously_synced = false;
        Ok(())
    }

    async fn reset_remote(&self) -> Result<()> {
        let mut state = self.state();
        state.remote_resets += 1;
        state.remote_manifest = None;
        state.previously_synced = false;
        Ok(())
    }

    fn subscribe_local_changes(&self) -> broadcast::Receiver<String> {
        self.shared.local_changes.subscribe()
    }
}

/// Task produced by [`MemorySyncService`].
pub struct MemorySyncTask {
    manifest: Option<Manifest>,
    shared: Arc<SyncShared>,
    stopped: CancellationToken,
}

#[async_trait]
impl SyncTask for MemorySyncTask {
    fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    async fn run(&self) -> Result<()> {
        let delay = {
            let mut state = lock(&self.shared.state);
            state.runs_started += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.run_delay
        };

        let waited = if delay.is_zero() {
            Ok(())
        } else {
            tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(()),
                _ = self.stopped.cancelled() => Err(Error::Cancelled),
            }
        };

        let mut state = lock(&self.shared.state);
        state.in_flight -= 1;
        waited?;

        if let Some(error) = state.failures.pop_front() {
            return Err(error.into());
        }
        if state.remote_manifest.is_none() {
            state.remote_manifest = Some(Manifest::new(Uuid::new_v4().to_string()));
        }
        state.previously_synced = true;
        state.runs_completed += 1;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.cancel();
        lock(&self.shared.state).stops += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MachinesState {
    machines: Vec<Machine>,
    lookups: usize,
    additions: usize,
    removals: usize,
}

/// Machines registry held in memory.
pub struct MemoryMachines {
    current: MachineId,
    state: Mutex<MachinesState>,
}

impl MemoryMachines {
    pub fn new(current: MachineId) -> Self {
        Self {
            current,
            state: Mutex::new(MachinesState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MachinesState> {
        lock(&self.state)
    }

    /// Register a machine directly, bypassing the counters.
    pub fn insert(&self, machine: Machine) {
        let mut state = self.state();
        state.machines.retain(|existing| existing.id != machine.id);
        state.machines.push(machine);
    }

    /// Disable a machine as another machine would.
    pub fn disable(&self, id: &MachineId) {
        if let Some(machine) = self.state().machines.iter_mut().find(|m| m.id == *id) {
            machine.disabled = true;
        }
    }

    pub fn snapshot(&self) -> Vec<Machine> {
        self.state().machines.clone()
    }

    pub fn lookups(&self) -> usize {
        self.state().lookups
    }

    pub fn additions(&self) -> usize {
        self.state().additions
    }

    pub fn removals(&self) -> usize {
        self.state().removals
    }
}

#[async_trait]
impl MachinesRegistry for MemoryMachines {
    async fn get_machines(&self, _manifest: Option<&Manifest>) -> Result<Vec<Machine>> {
        let mut state = self.state();
        state.lookups += 1;
        Ok(state
            .machines
            .iter()
            .cloned()
            .map(|mut machine| {
                machine.is_current = machine.id == self.current;
                machine
            })
            .collect())
    }

    async fn add_current_machine(&self, _manifest: Option<&Manifest>) -> Result<()> {
        let mut state = self.state();
        state.additions += 1;
        if !state.machines.iter().any(|m| m.id == self.current) {
            state.machines.push(Machine {
                id: self.current.clone(),
                name: format!("machine {}", self.current),
                is_current: true,
                disabled: false,
            });
        }
        Ok(())
    }

    async fn remove_current_machine(&self) -> Result<()> {
        let mut state = self.state();
        state.removals += 1;
        let current = &self.current;
        state.machines.retain(|m| m.id != *current);
        Ok(())
    }

    async fn set_enablement(&self, id: &MachineId, enabled: bool) -> Result<()> {
        let mut state = self.state();
        let machine = state
            .machines
            .iter_mut()
            .find(|m| m.id == *id)
            .ok_or_else(|| Error::NotFound(format!("Machine not found: {}", id)))?;
        machine.disabled = !enabled;
        Ok(())
    }

    async fn rename_machine(&self, id: &MachineId, name: &str) -> Result<()> {
        let mut state = self.state();
        let machine = state
            .machines
            .iter_mut()
            .find(|m| m.id == *id)
            .ok_or_else(|| Error::NotFound(format!("Machine not found: {}", id)))?;
        machine.name = name.to_string();
        Ok(())
    }
}

/// Account service with a switchable signed-in state.
pub struct MemoryAccounts {
    present: AtomicBool,
    changes: broadcast::Sender<()>,
}

impl MemoryAccounts {
    pub fn new(signed_in: bool) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            present: AtomicBool::new(signed_in),
            changes,
        }
    }

    pub fn set_account(&self, signed_in: bool) {
        self.present.store(signed_in, Ordering::SeqCst);
        let _ = self.changes.send(());
    }
}

impl AccountService for MemoryAccounts {
    fn has_account(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

/// Remote store throttling signal.
pub struct MemoryStoreSignal {
    until: Mutex<Option<DateTime<Utc>>>,
    changes: broadcast::Sender<()>,
}

impl MemoryStoreSignal {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            until: Mutex::new(None),
            changes,
        }
    }

    pub fn set_donot_make_requests_until(&self, until: Option<DateTime<Utc>>) {
        *lock(&self.until) = until;
        let _ = self.changes.send(());
    }
}

impl Default for MemoryStoreSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStoreSignal for MemoryStoreSignal {
    fn donot_make_requests_until(&self) -> Option<DateTime<Utc>> {
        *lock(&self.until)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

/// Resource enablement switches.
pub struct MemoryResources {
    changes: broadcast::Sender<(SyncResource, bool)>,
}

impl MemoryResources {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self { changes }
    }

    pub fn set_enablement(&self, resource: SyncResource, enabled: bool) {
        let _ = self.changes.send((resource, enabled));
    }
}

impl Default for MemoryResources {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceEnablement for MemoryResources {
    fn subscribe(&self) -> broadcast::Receiver<(SyncResource, bool)> {
        self.changes.subscribe()
    }
}

/// A full set of in-memory collaborators around a given storage.
pub struct MemoryCollaborators {
    pub machine_id: MachineId,
    pub sync: Arc<MemorySyncService>,
    pub accounts: Arc<MemoryAccounts>,
    pub store_signal: Arc<MemoryStoreSignal>,
    pub machines: Arc<MemoryMachines>,
    pub resources: Arc<MemoryResources>,
    pub storage: Arc<dyn KeyValueStore>,
}

impl MemoryCollaborators {
    /// Signed-in collaborators with no remote session.
    pub fn new(machine_id: MachineId, storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            sync: Arc::new(MemorySyncService::new()),
            accounts: Arc::new(MemoryAccounts::new(true)),
            store_signal: Arc::new(MemoryStoreSignal::new()),
            machines: Arc::new(MemoryMachines::new(machine_id.clone())),
            resources: Arc::new(MemoryResources::new()),
            machine_id,
            storage,
        }
    }

    pub fn context(&self) -> SyncContext {
        SyncContext {
            machine_id: self.machine_id.clone(),
            sync: self.sync.clone(),
            accounts: self.accounts.clone(),
            store_signal: self.store_signal.clone(),
            machines: self.machines.clone(),
            resources: self.resources.clone(),
            storage: self.storage.clone(),
        }
    }
}
