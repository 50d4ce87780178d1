//! Auto-sync enablement policy.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use usersync_common::{Error, Result};
use usersync_storage::KeyValueStore;

use crate::config::EnablementConfig;
use crate::session::keys;

/// Decides whether auto-sync is permitted for this installation.
///
/// A deployment override, when present, is authoritative. Otherwise the
/// persisted user preference applies, falling back to the configured
/// default.
pub struct EnablementPolicy {
    storage: Arc<dyn KeyValueStore>,
    config: EnablementConfig,
    changes: broadcast::Sender<bool>,
    /// Last effective value announced to subscribers.
    last: Mutex<bool>,
}

impl EnablementPolicy {
    pub fn new(storage: Arc<dyn KeyValueStore>, config: EnablementConfig) -> Self {
        let (changes, _) = broadcast::channel(16);
        let initial = Self::effective(storage.as_ref(), &config);
        Self {
            storage,
            config,
            changes,
            last: Mutex::new(initial),
        }
    }

    fn effective(storage: &dyn KeyValueStore, config: &EnablementConfig) -> bool {
        config.overridden.unwrap_or_else(|| {
            storage
                .get_bool(keys::ENABLEMENT)
                .unwrap_or(config.default_enabled)
        })
    }

    /// Effective enablement.
    pub fn is_enabled(&self) -> bool {
        Self::effective(self.storage.as_ref(), &self.config)
    }

    /// Deployment override, if any.
    pub fn overridden(&self) -> Option<bool> {
        self.config.overridden
    }

    /// Persisted user preference, or the default when none is stored.
    pub fn user_preference(&self) -> bool {
        self.storage
            .get_bool(keys::ENABLEMENT)
            .unwrap_or(self.config.default_enabled)
    }

    /// The user may toggle enablement only without a deployment override.
    pub fn can_toggle(&self) -> bool {
        self.config.overridden.is_none()
    }

    /// Persist the user preference.
    ///
    /// # Errors
    /// - `NotPermitted` when a deployment override exists
    /// - Storage write failure
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        if !self.can_toggle() {
            return Err(Error::NotPermitted(
                "Auto sync enablement is set by the deployment".to_string(),
            ));
        }
        self.storage.set_bool(keys::ENABLEMENT, enabled)?;
        self.refresh();
        Ok(())
    }

    /// Subscribe to changes of the effective value.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.changes.subscribe()
    }

    /// Announce the effective value if it differs from the last one.
    fn refresh(&self) -> Option<bool> {
        let current = self.is_enabled();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == current {
            return None;
        }
        *last = current;
        drop(last);

        info!("Auto sync enablement changed: {}", current);
        let _ = self.changes.send(current);
        Some(current)
    }

    /// Follow storage changes made by other windows or processes.
    ///
    /// The task ends when the policy is dropped or the store closes.
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let policy = Arc::downgrade(self);
        let mut rx = self.storage.subscribe();

        tokio::spawn(async move {
            loop {
                let relevant = match rx.recv().await {
                    Ok(change) => change.key == keys::ENABLEMENT,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Enablement watcher skipped {} storage changes", skipped);
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
                if !relevant {
                    continue;
                }
                let Some(policy) = policy.upgrade() else {
                    break;
                };
                policy.refresh();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use usersync_storage::MemoryStore;

    fn policy(config: EnablementConfig) -> (Arc<MemoryStore>, Arc<EnablementPolicy>) {
        let store = Arc::new(MemoryStore::new());
        let policy = Arc::new(EnablementPolicy::new(store.clone(), config));
        (store, policy)
    }

    #[test]
    fn test_default_preference() {
        let (_, policy) = policy(EnablementConfig {
            default_enabled: true,
            overridden: None,
        });
        assert!(policy.is_enabled());
        assert!(policy.can_toggle());
    }

    #[test]
    fn test_override_is_authoritative() {
        let (store, policy) = policy(EnablementConfig {
            default_enabled: true,
            overridden: Some(false),
        });
        store.set_bool(keys::ENABLEMENT, true).unwrap();

        assert!(!policy.is_enabled());
        assert!(policy.user_preference());
        assert!(!policy.can_toggle());
        assert!(matches!(
            policy.set_enabled(true),
            Err(Error::NotPermitted(_))
        ));
    }

    #[test]
    fn test_set_enabled_notifies_only_on_change() {
        let (store, policy) = policy(EnablementConfig::default());
        let mut rx = policy.subscribe();

        policy.set_enabled(true).unwrap();
        policy.set_enabled(true).unwrap();
        policy.set_enabled(false).unwrap();

        assert_eq!(rx.try_recv().unwrap(), true);
        assert_eq!(rx.try_recv().unwrap(), false);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.get_bool(keys::ENABLEMENT), Some(false));
    }

    #[tokio::test]
    async fn test_external_change_is_reemitted() {
        let (store, policy) = policy(EnablementConfig::default());
        let mut rx = policy.subscribe();
        let watcher = policy.watch();

        store.apply_external(keys::ENABLEMENT, Some("true"));

        let value = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(value);
        assert!(policy.is_enabled());

        watcher.abort();
    }

    #[tokio::test]
    async fn test_unrelated_keys_are_ignored() {
        let (store, policy) = policy(EnablementConfig::default());
        let mut rx = policy.subscribe();
        let watcher = policy.watch();

        store.apply_external("something.else", Some("true"));
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
        watcher.abort();
    }
}
