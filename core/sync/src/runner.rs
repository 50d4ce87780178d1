//! Single-pass reconciliation protocol and the periodic runner.
//!
//! A [`SyncRunner`] runs one pass immediately when started and another one
//! a fixed interval after each pass completes. Triggered passes go through
//! the same runner. A FIFO lock guarantees that at most one pass is in
//! flight; later requests wait for the earlier pass to finish and abort
//! without running once the runner is stopped.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use usersync_common::{Result, SyncError, SyncErrorCode};

use crate::machines::{MachineIdentityGate, MachineStanding};
use crate::scheduler::SyncTrigger;
use crate::services::{SyncService, SyncTask};
use crate::session::SessionStore;

/// Notifications emitted by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// A pass started.
    Started(SyncTrigger),
    /// A pass finished, with the error when it failed. Cancelled passes
    /// emit nothing.
    Finished(Option<SyncError>),
}

/// How a single pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Succeeded,
    Failed(SyncError),
    Cancelled,
}

enum PassFlow {
    Completed,
    Cancelled,
}

struct RunnerInner {
    sync: Arc<dyn SyncService>,
    gate: Arc<MachineIdentityGate>,
    sessions: SessionStore,
    interval: Duration,
    pass_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    active_task: Mutex<Option<Arc<dyn SyncTask>>>,
    events: mpsc::UnboundedSender<RunnerEvent>,
}

/// Runs reconciliation passes, one at a time.
pub struct SyncRunner {
    inner: Arc<RunnerInner>,
    interval_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncRunner {
    pub fn new(
        sync: Arc<dyn SyncService>,
        gate: Arc<MachineIdentityGate>,
        sessions: SessionStore,
        interval: Duration,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                sync,
                gate,
                sessions,
                interval,
                pass_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                active_task: Mutex::new(None),
                events,
            }),
            interval_task: Mutex::new(None),
        }
    }

    /// Run a pass now and then every interval after each pass completes.
    ///
    /// Calling `start` again is a no-op.
    pub fn start(&self) {
        let mut slot = self
            .interval_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }

        let inner = self.inner.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                inner.sync(SyncTrigger::interval()).await;
                tokio::select! {
                    _ = tokio::time::sleep(inner.interval) => {}
                    _ = inner.shutdown.cancelled() => break,
                }
            }
        }));
    }

    /// Run a pass after any pass in flight has finished.
    pub async fn sync(&self, trigger: SyncTrigger) -> PassOutcome {
        self.inner.sync(trigger).await
    }

    /// Run a pass on a background task.
    pub fn spawn_sync(&self, trigger: SyncTrigger) -> JoinHandle<PassOutcome> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.sync(trigger).await })
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel the pass in flight and the interval timer.
    ///
    /// Safe to call with no pass in flight and more than once.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let interval_task = self
            .interval_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = interval_task {
            handle.abort();
        }

        let active = self.inner.take_active_task();
        if let Some(task) = active {
            debug!("Stopping sync task in flight");
            if let Err(e) = task.stop().await {
                warn!("Failed to stop sync task: {}", e);
            }
        }
    }
}

impl Drop for SyncRunner {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self
            .interval_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl RunnerInner {
    async fn sync(&self, trigger: SyncTrigger) -> PassOutcome {
        let _guard = tokio::select! {
            guard = self.pass_lock.lock() => guard,
            _ = self.shutdown.cancelled() => return PassOutcome::Cancelled,
        };
        if self.shutdown.is_cancelled() {
            return PassOutcome::Cancelled;
        }
        self.do_sync(trigger).await
    }

    async fn do_sync(&self, trigger: SyncTrigger) -> PassOutcome {
        debug!(reason = %trigger.reason, sources = ?trigger.sources, "Sync pass started");
        let _ = self.events.send(RunnerEvent::Started(trigger));

        let result = self.reconcile().await;
        self.take_active_task();

        match result {
            Ok(PassFlow::Completed) => {
                debug!("Sync pass finished");
                let _ = self.events.send(RunnerEvent::Finished(None));
                PassOutcome::Succeeded
            }
            Ok(PassFlow::Cancelled) => {
                debug!("Sync pass cancelled");
                PassOutcome::Cancelled
            }
            Err(e) if self.shutdown.is_cancelled() => {
                debug!("Sync pass cancelled: {}", e);
                PassOutcome::Cancelled
            }
            Err(e) => {
                error!("Sync pass failed: {}", e);
                let err = e.to_sync_error();
                let _ = self.events.send(RunnerEvent::Finished(Some(err.clone())));
                PassOutcome::Failed(err)
            }
        }
    }

    async fn reconcile(&self) -> Result<PassFlow> {
        let task = self.sync.create_sync_task().await?;
        self.set_active_task(task.clone());
        if self.shutdown.is_cancelled() {
            return Ok(PassFlow::Cancelled);
        }

        let session = self.sessions.observe(task.manifest());

        if session.manifest.is_none() && self.sync.has_previously_synced().await? {
            return Err(SyncError::new(
                SyncErrorCode::TurnedOff,
                "Auto Sync: Sync is turned off in the cloud.",
            )
            .into());
        }

        if session.is_expired() {
            return Err(SyncError::new(
                SyncErrorCode::SessionExpired,
                "Auto Sync: Cloud has a new session.",
            )
            .into());
        }

        let standing = self.gate.standing(session.manifest.as_ref()).await?;
        if self.shutdown.is_cancelled() {
            return Ok(PassFlow::Cancelled);
        }

        if standing == MachineStanding::Disabled {
            return Err(SyncError::new(
                SyncErrorCode::TurnedOff,
                "Auto Sync: Sync is turned off on this machine from another machine.",
            )
            .into());
        }

        tokio::select! {
            result = task.run() => result?,
            _ = self.shutdown.cancelled() => return Ok(PassFlow::Cancelled),
        }

        // A run creates the remote session when there was none.
        let latest = match session.manifest.clone() {
            Some(manifest) => Some(manifest),
            None => self.sync.fetch_manifest().await?,
        };
        if self.shutdown.is_cancelled() {
            return Ok(PassFlow::Cancelled);
        }

        if let Some(latest) = &latest {
            if session.needs_update(latest) {
                debug!("Recording sync session {}", latest.session);
                self.sessions.set_session_id(&latest.session)?;
            }
        }

        if self.shutdown.is_cancelled() {
            return Ok(PassFlow::Cancelled);
        }

        if standing == MachineStanding::Unregistered {
            info!("First sync from this machine");
            self.gate.register(latest.as_ref()).await?;
        }

        Ok(PassFlow::Completed)
    }

    fn set_active_task(&self, task: Arc<dyn SyncTask>) {
        *self
            .active_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn take_active_task(&self) -> Option<Arc<dyn SyncTask>> {
        self.active_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnablementConfig;
    use crate::enablement::EnablementPolicy;
    use crate::memory::MemoryCollaborators;
    use usersync_common::{Machine, MachineId, Manifest};
    use usersync_storage::{KeyValueStore, MemoryStore};

    struct Fixture {
        collab: MemoryCollaborators,
        sessions: SessionStore,
        runner: SyncRunner,
        events: mpsc::UnboundedReceiver<RunnerEvent>,
    }

    fn fixture() -> Fixture {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let collab = MemoryCollaborators::new(MachineId::new("this-machine").unwrap(), storage);
        let enablement = Arc::new(EnablementPolicy::new(
            collab.storage.clone(),
            EnablementConfig::default(),
        ));
        let gate = Arc::new(MachineIdentityGate::new(
            collab.machine_id.clone(),
            collab.machines.clone(),
            collab.storage.clone(),
            enablement,
            collab.accounts.clone(),
            Duration::from_secs(600),
        ));
        let sessions = SessionStore::new(collab.storage.clone());
        let (tx, events) = mpsc::unbounded_channel();
        let runner = SyncRunner::new(
            collab.sync.clone(),
            gate,
            sessions.clone(),
            Duration::from_secs(300),
            tx,
        );
        Fixture {
            collab,
            sessions,
            runner,
            events,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<RunnerEvent>) -> Vec<RunnerEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test]
    async fn test_first_sync_registers_machine_and_records_session() {
        let mut f = fixture();

        let outcome = f.runner.sync(SyncTrigger::activity(vec!["x".into()])).await;
        assert_eq!(outcome, PassOutcome::Succeeded);

        let remote = f.collab.sync.remote_manifest().unwrap();
        assert_eq!(f.sessions.session_id(), Some(remote.session));
        assert_eq!(f.collab.machines.additions(), 1);
        assert_eq!(f.collab.machines.snapshot().len(), 1);

        let events = drain(&mut f.events);
        assert_eq!(
            events,
            vec![
                RunnerEvent::Started(SyncTrigger::activity(vec!["x".into()])),
                RunnerEvent::Finished(None),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_sync_does_not_register_again() {
        let f = fixture();
        f.runner.sync(SyncTrigger::interval()).await;
        f.runner.sync(SyncTrigger::interval()).await;

        assert_eq!(f.collab.machines.additions(), 1);
        assert_eq!(f.collab.sync.runs_completed(), 2);
    }

    #[tokio::test]
    async fn test_turned_off_in_cloud() {
        let mut f = fixture();
        f.collab.sync.set_previously_synced(true);

        let outcome = f.runner.sync(SyncTrigger::interval()).await;
        match outcome {
            PassOutcome::Failed(err) => assert_eq!(err.code, SyncErrorCode::TurnedOff),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(f.collab.sync.runs_started(), 0);
        assert_eq!(f.collab.machines.lookups(), 0);

        let events = drain(&mut f.events);
        assert!(matches!(
            events.last(),
            Some(RunnerEvent::Finished(Some(err))) if err.code == SyncErrorCode::TurnedOff
        ));
    }

    #[tokio::test]
    async fn test_session_expired_before_machines_lookup() {
        let f = fixture();
        f.sessions.set_session_id("old-session").unwrap();
        f.collab.sync.set_remote_manifest(Some(Manifest::new("new-session")));

        let outcome = f.runner.sync(SyncTrigger::interval()).await;
        assert!(matches!(
            outcome,
            PassOutcome::Failed(ref err) if err.code == SyncErrorCode::SessionExpired
        ));
        assert_eq!(f.collab.machines.lookups(), 0);
        assert_eq!(f.collab.sync.runs_started(), 0);
        assert_eq!(f.sessions.session_id().as_deref(), Some("old-session"));
    }

    #[tokio::test]
    async fn test_machine_disabled_from_elsewhere() {
        let f = fixture();
        f.collab.machines.insert(Machine {
            id: f.collab.machine_id.clone(),
            name: "this".into(),
            is_current: true,
            disabled: true,
        });

        let outcome = f.runner.sync(SyncTrigger::interval()).await;
        assert!(matches!(
            outcome,
            PassOutcome::Failed(ref err) if err.code == SyncErrorCode::TurnedOff
        ));
        assert_eq!(f.collab.sync.runs_started(), 0);
    }

    #[tokio::test]
    async fn test_unclassified_failure() {
        let f = fixture();
        f.collab.sync.fail_next_run(SyncError::new(SyncErrorCode::Unknown, "boom"));

        let outcome = f.runner.sync(SyncTrigger::interval()).await;
        assert!(matches!(
            outcome,
            PassOutcome::Failed(ref err) if err.code == SyncErrorCode::Unknown
        ));
        assert!(f.sessions.session_id().is_none());
        assert_eq!(f.collab.machines.additions(), 0);
    }

    #[tokio::test]
    async fn test_existing_session_is_kept() {
        let f = fixture();
        f.sessions.set_session_id("s1").unwrap();
        f.collab.sync.set_remote_manifest(Some(Manifest::new("s1")));
        f.collab.sync.set_previously_synced(true);

        assert_eq!(f.runner.sync(SyncTrigger::interval()).await, PassOutcome::Succeeded);
        assert_eq!(f.sessions.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_are_serialized() {
        let f = fixture();
        f.collab.sync.set_run_delay(Duration::from_secs(5));

        let first = f.runner.spawn_sync(SyncTrigger::activity(vec!["a".into()]));
        let second = f.runner.spawn_sync(SyncTrigger::activity(vec!["b".into()]));
        let third = f.runner.sync(SyncTrigger::interval()).await;

        assert_eq!(first.await.unwrap(), PassOutcome::Succeeded);
        assert_eq!(second.await.unwrap(), PassOutcome::Succeeded);
        assert_eq!(third, PassOutcome::Succeeded);
        assert_eq!(f.collab.sync.max_in_flight(), 1);
        assert_eq!(f.collab.sync.runs_completed(), 3);
        assert_eq!(f.collab.machines.additions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_pass_emits_nothing_and_mutates_nothing() {
        let mut f = fixture();
        f.collab.sync.set_run_delay(Duration::from_secs(30));

        let pass = f.runner.spawn_sync(SyncTrigger::interval());
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.runner.stop().await;

        assert_eq!(pass.await.unwrap(), PassOutcome::Cancelled);
        assert_eq!(f.collab.sync.stops(), 1);
        assert!(f.sessions.session_id().is_none());
        assert_eq!(f.collab.machines.additions(), 0);

        let events = drain(&mut f.events);
        assert!(events
            .iter()
            .all(|event| matches!(event, RunnerEvent::Started(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_request_aborts_after_stop() {
        let mut f = fixture();
        f.collab.sync.set_run_delay(Duration::from_secs(30));

        let first = f.runner.spawn_sync(SyncTrigger::interval());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = f.runner.spawn_sync(SyncTrigger::activity(vec!["late".into()]));
        tokio::time::sleep(Duration::from_secs(1)).await;

        f.runner.stop().await;

        assert_eq!(first.await.unwrap(), PassOutcome::Cancelled);
        assert_eq!(second.await.unwrap(), PassOutcome::Cancelled);
        assert_eq!(f.collab.sync.tasks_created(), 1);

        let started = drain(&mut f.events)
            .into_iter()
            .filter(|event| matches!(event, RunnerEvent::Started(_)))
            .count();
        assert_eq!(started, 1);

        assert_eq!(f.runner.sync(SyncTrigger::interval()).await, PassOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_now_and_every_interval() {
        let f = fixture();
        f.runner.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.collab.sync.runs_completed(), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(f.collab.sync.runs_completed(), 2);

        f.runner.stop().await;
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(f.collab.sync.runs_completed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_continues_after_failure() {
        let f = fixture();
        f.collab.sync.fail_next_run(SyncError::new(SyncErrorCode::Unknown, "flaky"));
        f.runner.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.collab.sync.runs_completed(), 0);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(f.collab.sync.runs_completed(), 1);
        f.runner.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_pass_is_safe() {
        let f = fixture();
        f.runner.stop().await;
        f.runner.stop().await;
        assert!(f.runner.is_stopped());
    }
}
