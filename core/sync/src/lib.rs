//! Auto-sync coordination for usersync.
//!
//! This module decides when a synchronization pass of user settings runs:
//! - Permission gating on enablement, account availability and server throttling
//! - Periodic passes plus debounced, coalesced triggered passes
//! - Exponential backoff of triggers after unclassified failures
//! - Session and machine identity checks before every pass
//! - Classified recovery from pass failures, including delayed machine removal

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod enablement;
pub mod machines;
pub mod memory;
pub mod runner;
pub mod scheduler;
pub mod services;
pub mod session;
pub mod status;

// Re-export main types
pub use backoff::TriggerBackoff;
pub use config::{AutoSyncConfig, EnablementConfig};
pub use coordinator::{
    AutoSyncCoordinator, TurnOffOptions, LOCAL_CHANGE_SOURCE, RESOURCE_ENABLEMENT_SOURCE,
};
pub use enablement::EnablementPolicy;
pub use machines::{MachineIdentityGate, MachineStanding, MachinesRegistry};
pub use memory::{
    MemoryAccounts, MemoryCollaborators, MemoryMachines, MemoryResources, MemoryStoreSignal,
    MemorySyncService, MemorySyncTask,
};
pub use runner::{PassOutcome, RunnerEvent, SyncRunner};
pub use scheduler::{SyncTrigger, TriggerScheduler};
pub use services::{
    AccountService, ResourceEnablement, SyncContext, SyncService, SyncStoreSignal, SyncTask,
};
pub use session::{SessionStore, SyncSession};
pub use status::{AutoSyncInputs, AutoSyncStatus, SuspendReason};
