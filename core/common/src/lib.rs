//! Common utilities and types shared across the usersync crates.
//!
//! This module provides the error taxonomy reported by synchronization passes
//! and the value types exchanged with the remote store and machines registry.

pub mod error;
pub mod types;

pub use error::{Error, Result, SyncError, SyncErrorCode};
pub use types::{Machine, MachineId, Manifest, SyncResource};
