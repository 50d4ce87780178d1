//! Persisted key-value storage for usersync.
//!
//! This module provides a trait-based interface over the globally scoped
//! key-value storage the sync coordinator keeps its flags in, together with
//! an in-memory backend and a JSON file backend.
//!
//! # Design Principles
//! - Global scope: values are shared by every window/process of an installation
//! - Change notifications: every effective change is broadcast to subscribers
//! - Cross-process consistency: writes from elsewhere surface as external changes

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{ChangeOrigin, KeyValueStore, StorageChange};
