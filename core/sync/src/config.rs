//! Auto-sync configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use usersync_common::{Error, Result};

/// Deployment-level enablement settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnablementConfig {
    /// User preference used when nothing has been persisted yet.
    pub default_enabled: bool,
    /// Deployment override. When set, the user preference is ignored and
    /// cannot be toggled.
    pub overridden: Option<bool>,
}

/// Configuration for the auto-sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSyncConfig {
    /// Enablement defaults and override.
    pub enablement: EnablementConfig,
    /// Period between interval passes.
    pub interval: Duration,
    /// Base debounce delay for triggered passes.
    pub trigger_delay: Duration,
    /// Cap on the exponential backoff multiplier.
    pub max_backoff_multiplier: u32,
    /// Triggers asking to skip recent syncs are dropped within this window.
    pub recent_sync_window: Duration,
    /// Wait before removing this machine after a rate-limit or
    /// compatibility turn-off.
    pub disable_machine_delay: Duration,
    /// Maximum number of distinct reason tags kept between dispatches.
    pub max_pending_sources: usize,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enablement: EnablementConfig::default(),
            interval: Duration::from_secs(5 * 60),
            trigger_delay: Duration::from_millis(1000),
            max_backoff_multiplier: 60,
            recent_sync_window: Duration::from_secs(10),
            disable_machine_delay: Duration::from_secs(10 * 60),
            max_pending_sources: 64,
        }
    }
}

impl AutoSyncConfig {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
