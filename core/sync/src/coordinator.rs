//! Top-level auto-sync service.
//!
//! The coordinator is a single background task that owns all mutable
//! scheduling state: the runner, the debounce timer, the failure counter
//! and the pending trigger sources. External signals and caller commands
//! are processed one at a time, so every scheduling decision sees the
//! latest signal.

use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use usersync_common::{Error, Result, SyncError, SyncErrorCode, SyncResource};

use crate::backoff::TriggerBackoff;
use crate::config::AutoSyncConfig;
use crate::enablement::EnablementPolicy;
use crate::machines::MachineIdentityGate;
use crate::runner::{RunnerEvent, SyncRunner};
use crate::scheduler::{SyncTrigger, TriggerScheduler};
use crate::services::SyncContext;
use crate::session::SessionStore;
use crate::status::{AutoSyncInputs, AutoSyncStatus, SuspendReason};

/// Source tag for passes triggered by a resource enablement change.
pub const RESOURCE_ENABLEMENT_SOURCE: &str = "resourceEnablement";

/// Source tag used when local change notifications were missed.
pub const LOCAL_CHANGE_SOURCE: &str = "localChange";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How to turn sync off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnOffOptions {
    /// Also delete all data from the remote store.
    pub everywhere: bool,
    /// Log failures and force enablement off instead of returning them.
    pub soft_on_error: bool,
    /// Keep this machine registered.
    pub skip_machine_removal: bool,
}

impl TurnOffOptions {
    /// Turn off on this machine only.
    pub fn here() -> Self {
        Self::default()
    }

    /// Turn off and reset the remote store.
    pub fn everywhere() -> Self {
        Self {
            everywhere: true,
            ..Self::default()
        }
    }

    fn soft(skip_machine_removal: bool) -> Self {
        Self {
            everywhere: false,
            soft_on_error: true,
            skip_machine_removal,
        }
    }
}

enum Command {
    Trigger {
        sources: Vec<String>,
        skip_if_recent: bool,
    },
    TurnOn {
        reply: oneshot::Sender<Result<()>>,
    },
    TurnOff {
        options: TurnOffOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<AutoSyncStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the auto-sync background task.
pub struct AutoSyncCoordinator {
    commands: mpsc::Sender<Command>,
    enablement: Arc<EnablementPolicy>,
    gate: Arc<MachineIdentityGate>,
    errors: broadcast::Sender<SyncError>,
    started: broadcast::Sender<SyncTrigger>,
    finished: broadcast::Sender<Option<SyncError>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoSyncCoordinator {
    /// Spawn the coordinator.
    ///
    /// On start a delayed machine removal left over from an earlier process
    /// is resumed and permission is evaluated; when running, the first pass
    /// starts immediately.
    pub fn start(context: SyncContext, config: AutoSyncConfig) -> Self {
        let enablement = Arc::new(EnablementPolicy::new(
            context.storage.clone(),
            config.enablement.clone(),
        ));
        let gate = Arc::new(MachineIdentityGate::new(
            context.machine_id.clone(),
            context.machines.clone(),
            context.storage.clone(),
            enablement.clone(),
            context.accounts.clone(),
            config.disable_machine_delay,
        ));

        let (commands, command_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (errors, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (started, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (finished, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (runner_events, runner_event_rx) = mpsc::unbounded_channel();

        let signals = Signals {
            accounts: Some(context.accounts.subscribe()),
            store: Some(context.store_signal.subscribe()),
            enablement: Some(enablement.subscribe()),
            resources: Some(context.resources.subscribe()),
            local: Some(context.sync.subscribe_local_changes()),
        };

        let watcher = enablement.watch();
        let state = CoordinatorLoop {
            sessions: SessionStore::new(context.storage.clone()),
            backoff: TriggerBackoff::new(config.trigger_delay)
                .with_max_multiplier(config.max_backoff_multiplier),
            scheduler: TriggerScheduler::new(config.max_pending_sources),
            context,
            config,
            enablement: enablement.clone(),
            gate: gate.clone(),
            runner: None,
            runner_events,
            status: AutoSyncStatus::Disabled,
            successive_failures: 0,
            last_pass_started: None,
            recheck_at: None,
            watcher,
            errors: errors.clone(),
            started: started.clone(),
            finished: finished.clone(),
        };

        let task = tokio::spawn(state.run(command_rx, signals, runner_event_rx));

        Self {
            commands,
            enablement,
            gate,
            errors,
            started,
            finished,
            task: Mutex::new(Some(task)),
        }
    }

    /// Request a debounced sync pass.
    ///
    /// With `skip_if_recent`, the request is dropped when a pass started
    /// within the recent-sync window. A no-op while auto-sync is not
    /// running.
    pub async fn trigger_sync(&self, sources: Vec<String>, skip_if_recent: bool) -> Result<()> {
        self.send(Command::Trigger {
            sources,
            skip_if_recent,
        })
        .await
    }

    /// Turn auto-sync on and cancel any pending delayed machine removal.
    pub async fn turn_on(&self) -> Result<()> {
        self.request(|reply| Command::TurnOn { reply }).await?
    }

    /// Turn auto-sync off.
    pub async fn turn_off(&self, options: TurnOffOptions) -> Result<()> {
        self.request(|reply| Command::TurnOff { options, reply })
            .await?
    }

    /// Current permission status.
    pub async fn status(&self) -> Result<AutoSyncStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub fn enablement(&self) -> &Arc<EnablementPolicy> {
        &self.enablement
    }

    /// Whether a delayed removal of this machine is pending.
    pub fn has_pending_machine_removal(&self) -> bool {
        self.gate.has_pending_removal()
    }

    /// Classified and unclassified pass failures, after recovery ran.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<SyncError> {
        self.errors.subscribe()
    }

    pub fn subscribe_sync_started(&self) -> broadcast::Receiver<SyncTrigger> {
        self.started.subscribe()
    }

    /// Pass completions; `None` for success.
    pub fn subscribe_sync_finished(&self) -> broadcast::Receiver<Option<SyncError>> {
        self.finished.subscribe()
    }

    /// Stop the coordinator, cancelling the pass in flight and all timers.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::NotPermitted("Auto sync coordinator is not running".to_string()))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| Error::Cancelled)
    }
}

/// Subscriptions to external signals. A closed channel is dropped.
struct Signals {
    accounts: Option<broadcast::Receiver<()>>,
    store: Option<broadcast::Receiver<()>>,
    enablement: Option<broadcast::Receiver<bool>>,
    resources: Option<broadcast::Receiver<(SyncResource, bool)>>,
    local: Option<broadcast::Receiver<String>>,
}

/// Wait for the next signal. `None` means signals were missed.
async fn next_signal<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Option<T> {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(value) => return Some(value),
            Err(RecvError::Lagged(skipped)) => {
                debug!("Missed {} signals", skipped);
                return None;
            }
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct CoordinatorLoop {
    context: SyncContext,
    config: AutoSyncConfig,
    enablement: Arc<EnablementPolicy>,
    gate: Arc<MachineIdentityGate>,
    sessions: SessionStore,
    backoff: TriggerBackoff,
    scheduler: TriggerScheduler,
    runner: Option<SyncRunner>,
    runner_events: mpsc::UnboundedSender<RunnerEvent>,
    status: AutoSyncStatus,
    successive_failures: u32,
    last_pass_started: Option<Instant>,
    /// Re-evaluate permission when a rate-limit window ends.
    recheck_at: Option<Instant>,
    watcher: JoinHandle<()>,
    errors: broadcast::Sender<SyncError>,
    started: broadcast::Sender<SyncTrigger>,
    finished: broadcast::Sender<Option<SyncError>>,
}

impl CoordinatorLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: Signals,
        mut runner_events: mpsc::UnboundedReceiver<RunnerEvent>,
    ) {
        self.gate.resume_pending_removal();
        self.update_auto_sync().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = runner_events.recv() => self.handle_runner_event(event).await,
                _ = next_signal(&mut signals.accounts) => {
                    debug!("Account changed");
                    self.update_auto_sync().await;
                }
                _ = next_signal(&mut signals.store) => {
                    debug!("Sync store throttling changed");
                    self.update_auto_sync().await;
                }
                _ = next_signal(&mut signals.enablement) => self.update_auto_sync().await,
                change = next_signal(&mut signals.resources) => {
                    if let Some((resource, enabled)) = change {
                        debug!("Resource {} enablement changed: {}", resource, enabled);
                    }
                    self.update_auto_sync().await;
                    self.trigger(vec![RESOURCE_ENABLEMENT_SOURCE.to_string()], false);
                }
                source = next_signal(&mut signals.local) => {
                    let source = source.unwrap_or_else(|| LOCAL_CHANGE_SOURCE.to_string());
                    self.trigger(vec![source], false);
                }
                _ = sleep_until(self.scheduler.deadline()) => self.dispatch(),
                _ = sleep_until(self.recheck_at) => {
                    self.recheck_at = None;
                    self.update_auto_sync().await;
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Trigger {
                sources,
                skip_if_recent,
            } => self.trigger(sources, skip_if_recent),
            Command::TurnOn { reply } => {
                let result = self.turn_on().await;
                let _ = reply.send(result);
            }
            Command::TurnOff { options, reply } => {
                let result = self.turn_off(options).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status.clone());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Re-evaluate permission and start or tear down the runner.
    async fn update_auto_sync(&mut self) {
        let inputs = AutoSyncInputs {
            enabled: self.enablement.is_enabled(),
            has_account: self.context.accounts.has_account(),
            donot_make_requests_until: self.context.store_signal.donot_make_requests_until(),
            now: Utc::now(),
        };
        let status = inputs.evaluate();
        if status != self.status {
            info!("{}", status);
        }

        self.recheck_at = match &status {
            AutoSyncStatus::Suspended(SuspendReason::RateLimited { until }) => (*until - inputs.now)
                .to_std()
                .ok()
                .and_then(|remaining| Instant::now().checked_add(remaining)),
            _ => None,
        };
        self.status = status;

        if self.status.is_running() {
            if self.runner.is_none() {
                self.start_runner();
            }
        } else {
            self.scheduler.cancel();
            if let Some(runner) = self.runner.take() {
                runner.stop().await;
                info!("Auto Sync: Stopped");
            }
        }
    }

    fn start_runner(&mut self) {
        let runner = SyncRunner::new(
            self.context.sync.clone(),
            self.gate.clone(),
            self.sessions.clone(),
            self.config.interval,
            self.runner_events.clone(),
        );
        runner.start();
        self.runner = Some(runner);
        info!("Auto Sync: Started");
    }

    fn trigger(&mut self, sources: Vec<String>, skip_if_recent: bool) {
        if self.runner.is_none() {
            self.scheduler.cancel();
            return;
        }

        if skip_if_recent
            && self
                .last_pass_started
                .is_some_and(|started| started.elapsed() < self.config.recent_sync_window)
        {
            debug!(
                "Auto Sync: Skipped. Limited to once per {:?}.",
                self.config.recent_sync_window
            );
            return;
        }

        let delay = self.backoff.delay_for_failures(self.successive_failures);
        debug!(?sources, ?delay, "Auto Sync: Triggered");
        self.scheduler.schedule(sources, delay);
    }

    fn dispatch(&mut self) {
        let sources = self.scheduler.take();
        match &self.runner {
            Some(runner) => {
                debug!(?sources, "Auto Sync: Dispatching triggered sync");
                drop(runner.spawn_sync(SyncTrigger::activity(sources)));
            }
            None => debug!("Auto Sync: Dropping trigger, not running"),
        }
    }

    async fn handle_runner_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Started(trigger) => {
                self.last_pass_started = Some(Instant::now());
                let _ = self.started.send(trigger);
            }
            RunnerEvent::Finished(None) => {
                self.successive_failures = 0;
                let _ = self.finished.send(None);
            }
            RunnerEvent::Finished(Some(err)) => {
                self.handle_sync_error(&err).await;
                let _ = self.finished.send(Some(err.clone()));
                let _ = self.errors.send(err);
            }
        }
    }

    /// Decide recovery for a failed pass.
    async fn handle_sync_error(&mut self, err: &SyncError) {
        let resource = err
            .resource
            .map(|resource| resource.to_string())
            .unwrap_or_else(|| "some".to_string());

        match err.code {
            SyncErrorCode::SessionExpired => {
                // The machine stays registered for the new session.
                self.soft_turn_off(true).await;
                info!("Auto Sync: Turned off sync because current session is changed");
            }
            SyncErrorCode::TurnedOff => {
                self.soft_turn_off(false).await;
                info!("Auto Sync: Turned off sync because sync is turned off in the cloud");
            }
            SyncErrorCode::TooManyRequests | SyncErrorCode::LocalTooManyRequests => {
                // Removing the machine is a request too and would be rejected.
                self.soft_turn_off(true).await;
                self.disable_machine_eventually();
                info!("Auto Sync: Turned off sync because of making too many requests to server");
            }
            SyncErrorCode::UpgradeRequired | SyncErrorCode::Gone => {
                self.soft_turn_off(true).await;
                self.disable_machine_eventually();
                info!(
                    "Auto Sync: Turned off sync because current client is not compatible with server. Requires client upgrade."
                );
            }
            SyncErrorCode::IncompatibleLocalContent => {
                self.soft_turn_off(false).await;
                info!(
                    "Auto Sync: Turned off sync because server has {} content with newer version than of client. Requires client upgrade.",
                    resource
                );
            }
            SyncErrorCode::IncompatibleRemoteContent => {
                self.soft_turn_off(false).await;
                info!(
                    "Auto Sync: Turned off sync because server has {} content with older version than of client. Requires server reset.",
                    resource
                );
            }
            _ => {
                self.successive_failures = self.successive_failures.saturating_add(1);
                error!(
                    "Auto Sync: {} (successive failures: {})",
                    err, self.successive_failures
                );
            }
        }
    }

    fn disable_machine_eventually(&self) {
        if let Err(e) = self.gate.disable_machine_eventually() {
            error!("Auto Sync: Failed to schedule machine removal: {}", e);
        }
    }

    async fn soft_turn_off(&mut self, skip_machine_removal: bool) {
        if let Err(e) = self.turn_off(TurnOffOptions::soft(skip_machine_removal)).await {
            error!("Auto Sync: Failed to turn off sync: {}", e);
        }
    }

    async fn turn_on(&mut self) -> Result<()> {
        self.gate.stop_disable_machine_eventually()?;
        self.enablement.set_enabled(true)?;
        self.update_auto_sync().await;
        Ok(())
    }

    async fn turn_off(&mut self, options: TurnOffOptions) -> Result<()> {
        let result = match self.reset_sync_state(options).await {
            Ok(()) => Ok(()),
            Err(e) if options.soft_on_error => {
                error!("Auto Sync: Error while turning off sync: {}", e);
                if self.enablement.can_toggle() {
                    if let Err(e) = self.enablement.set_enabled(false) {
                        error!("Auto Sync: Failed to disable sync: {}", e);
                    }
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.update_auto_sync().await;
        result
    }

    async fn reset_sync_state(&mut self, options: TurnOffOptions) -> Result<()> {
        if !options.skip_machine_removal && self.context.accounts.has_account() {
            self.gate.remove().await?;
        }
        self.enablement.set_enabled(false)?;
        self.sessions.clear()?;
        if options.everywhere {
            info!("Auto Sync: Resetting remote data");
            self.context.sync.reset_remote().await
        } else {
            self.context.sync.reset_local().await
        }
    }

    async fn teardown(&mut self) {
        self.scheduler.cancel();
        if let Some(runner) = self.runner.take() {
            runner.stop().await;
        }
        self.gate.suspend();
        self.watcher.abort();
        info!("Auto sync coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCollaborators;
    use crate::session::keys;
    use std::fmt::Debug;
    use std::time::Duration;
    use usersync_common::{Machine, MachineId, Manifest};
    use usersync_storage::{KeyValueStore, MemoryStore};

    struct Harness {
        collab: MemoryCollaborators,
        coordinator: AutoSyncCoordinator,
        started: broadcast::Receiver<SyncTrigger>,
        finished: broadcast::Receiver<Option<SyncError>>,
        errors: broadcast::Receiver<SyncError>,
    }

    fn collaborators() -> MemoryCollaborators {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        MemoryCollaborators::new(MachineId::new("this-machine").unwrap(), storage)
    }

    fn enabled_config() -> AutoSyncConfig {
        let mut config = AutoSyncConfig::default();
        config.enablement.default_enabled = true;
        config
    }

    fn start(collab: MemoryCollaborators, config: AutoSyncConfig) -> Harness {
        let coordinator = AutoSyncCoordinator::start(collab.context(), config);
        Harness {
            started: coordinator.subscribe_sync_started(),
            finished: coordinator.subscribe_sync_finished(),
            errors: coordinator.subscribe_errors(),
            collab,
            coordinator,
        }
    }

    /// Running coordinator whose initial pass has completed.
    async fn running() -> Harness {
        let mut h = start(collaborators(), enabled_config());
        assert_eq!(next(&mut h.started).await, SyncTrigger::interval());
        assert_eq!(next(&mut h.finished).await, None);
        h
    }

    async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn assert_quiet<T: Clone + Debug>(rx: &mut broadcast::Receiver<T>) {
        let received = rx.try_recv();
        assert!(received.is_err(), "unexpected event: {:?}", received);
    }

    fn this_machine(disabled: bool) -> Machine {
        Machine {
            id: MachineId::new("this-machine").unwrap(),
            name: "this machine".to_string(),
            is_current: true,
            disabled,
        }
    }

    fn trigger(sources: &[&str]) -> Vec<String> {
        sources.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_pass_registers_machine() {
        let h = running().await;

        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Running);
        assert_eq!(h.collab.machines.additions(), 1);
        assert_eq!(h.collab.sync.runs_completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_ignores_triggers() {
        let mut h = start(collaborators(), AutoSyncConfig::default());

        h.coordinator
            .trigger_sync(trigger(&["settings"]), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Disabled);
        assert_eq!(h.collab.sync.tasks_created(), 0);
        assert_quiet(&mut h.started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_coalesce_into_one_pass() {
        let mut h = running().await;
        let begin = Instant::now();

        h.coordinator.trigger_sync(trigger(&["a"]), false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.coordinator.trigger_sync(trigger(&["b"]), false).await.unwrap();
        h.coordinator.trigger_sync(trigger(&["a"]), false).await.unwrap();

        assert_eq!(
            next(&mut h.started).await,
            SyncTrigger::activity(trigger(&["a", "b"]))
        );
        // The last trigger restarted the debounce timer.
        assert!(begin.elapsed() >= Duration::from_millis(1500));
        assert_eq!(next(&mut h.finished).await, None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_quiet(&mut h.started);
        assert_eq!(h.collab.sync.runs_completed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_delay_backs_off_after_failures() {
        let mut h = running().await;
        let failure = SyncError::new(SyncErrorCode::Unknown, "server error");
        h.collab.sync.fail_next_run(failure.clone());
        h.collab.sync.fail_next_run(failure);

        let expected = [1, 2, 4, 1];
        for (i, secs) in expected.into_iter().enumerate() {
            let source = format!("t{}", i);
            let begin = Instant::now();
            h.coordinator
                .trigger_sync(vec![source.clone()], false)
                .await
                .unwrap();

            assert_eq!(
                next(&mut h.started).await,
                SyncTrigger::activity(vec![source])
            );
            let waited = begin.elapsed();
            assert!(waited >= Duration::from_secs(secs), "pass {} after {:?}", i, waited);
            assert!(waited < Duration::from_secs(secs) + Duration::from_millis(100));
            next(&mut h.finished).await;
        }

        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_if_recent_drops_trigger() {
        let mut h = running().await;

        h.coordinator.trigger_sync(trigger(&["focus"]), true).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_quiet(&mut h.started);

        tokio::time::sleep(Duration::from_secs(6)).await;
        h.coordinator.trigger_sync(trigger(&["focus"]), true).await.unwrap();
        assert_eq!(
            next(&mut h.started).await,
            SyncTrigger::activity(trigger(&["focus"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expired_turns_off_and_resets_local() {
        let collab = collaborators();
        collab.machines.insert(this_machine(false));
        collab.storage.set(keys::SESSION_ID, "old-session").unwrap();
        collab
            .sync
            .set_remote_manifest(Some(Manifest::new("new-session")));
        let mut h = start(collab, enabled_config());

        let err = next(&mut h.errors).await;
        assert_eq!(err.code, SyncErrorCode::SessionExpired);

        assert!(!h.coordinator.enablement().is_enabled());
        assert_eq!(h.collab.storage.get(keys::SESSION_ID), None);
        assert_eq!(h.collab.sync.local_resets(), 1);
        assert_eq!(h.collab.machines.removals(), 0);
        assert_eq!(h.collab.machines.snapshot(), vec![this_machine(false)]);
        assert!(!h.coordinator.has_pending_machine_removal());
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Disabled);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(h.collab.machines.removals(), 0);
    }

    async fn rate_limited() -> Harness {
        let mut h = running().await;
        h.collab.sync.fail_next_run(SyncError::new(
            SyncErrorCode::TooManyRequests,
            "too many requests",
        ));
        h.coordinator.trigger_sync(trigger(&["settings"]), false).await.unwrap();
        let err = next(&mut h.errors).await;
        assert_eq!(err.code, SyncErrorCode::TooManyRequests);
        h
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_keeps_machine_until_delay() {
        let h = rate_limited().await;

        assert!(!h.coordinator.enablement().is_enabled());
        assert!(h.coordinator.has_pending_machine_removal());
        assert_eq!(h.collab.machines.removals(), 0);
        assert_eq!(h.collab.machines.snapshot().len(), 1);

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert_eq!(h.collab.machines.removals(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.collab.machines.removals(), 1);
        assert!(h.collab.machines.snapshot().is_empty());
        assert!(!h.coordinator.has_pending_machine_removal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_on_cancels_delayed_removal() {
        let mut h = rate_limited().await;

        h.coordinator.turn_on().await.unwrap();
        assert!(!h.coordinator.has_pending_machine_removal());
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Running);

        let failed = next(&mut h.finished).await;
        assert_eq!(failed.map(|e| e.code), Some(SyncErrorCode::TooManyRequests));
        assert_eq!(next(&mut h.finished).await, None);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(h.collab.machines.removals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_loss_suspends() {
        let mut h = running().await;

        h.collab.accounts.set_account(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            h.coordinator.status().await.unwrap(),
            AutoSyncStatus::Suspended(SuspendReason::NoAccount)
        );

        h.coordinator.trigger_sync(trigger(&["settings"]), false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.collab.sync.tasks_created(), 1);

        h.collab.accounts.set_account(true);
        assert_eq!(next(&mut h.started).await, SyncTrigger::interval());
        assert_eq!(next(&mut h.finished).await, None);
        assert_eq!(h.collab.sync.tasks_created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_window_suspends_and_resumes() {
        let h = running().await;

        let until = Utc::now() + chrono::Duration::hours(1);
        h.collab.store_signal.set_donot_make_requests_until(Some(until));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            h.coordinator.status().await.unwrap(),
            AutoSyncStatus::Suspended(SuspendReason::RateLimited { until })
        );

        h.collab.store_signal.set_donot_make_requests_until(None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_off_everywhere_resets_remote() {
        let h = running().await;

        h.coordinator
            .turn_off(TurnOffOptions::everywhere())
            .await
            .unwrap();

        assert_eq!(h.collab.sync.remote_resets(), 1);
        assert_eq!(h.collab.sync.local_resets(), 0);
        assert_eq!(h.collab.machines.removals(), 1);
        assert!(h.collab.sync.remote_manifest().is_none());
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_off_under_override_fails() {
        let mut config = enabled_config();
        config.enablement.overridden = Some(true);
        let mut h = start(collaborators(), config);
        next(&mut h.finished).await;

        let result = h.coordinator.turn_off(TurnOffOptions::here()).await;
        assert!(matches!(result, Err(Error::NotPermitted(_))));
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_change_triggers_pass() {
        let mut h = running().await;

        h.collab.sync.notify_local_change("settings");
        assert_eq!(
            next(&mut h.started).await,
            SyncTrigger::activity(trigger(&["settings"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_enablement_change_triggers_pass() {
        let mut h = running().await;

        h.collab
            .resources
            .set_enablement(SyncResource::Keybindings, false);
        assert_eq!(
            next(&mut h.started).await,
            SyncTrigger::activity(trigger(&[RESOURCE_ENABLEMENT_SOURCE]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_failure_keeps_running() {
        let collab = collaborators();
        collab
            .sync
            .fail_next_run(SyncError::new(SyncErrorCode::Unknown, "connection reset"));
        let mut h = start(collab, enabled_config());

        assert_eq!(next(&mut h.errors).await.code, SyncErrorCode::Unknown);
        assert!(h.coordinator.enablement().is_enabled());
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pass_in_flight() {
        let collab = collaborators();
        collab.sync.set_run_delay(Duration::from_secs(30));
        let mut h = start(collab, enabled_config());

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.coordinator.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.collab.sync.stops(), 1);
        assert_eq!(h.collab.sync.runs_completed(), 0);
        assert_quiet(&mut h.finished);
        assert!(h.coordinator.trigger_sync(Vec::new(), false).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_content_turns_off_with_resource() {
        let collab = collaborators();
        collab.sync.fail_next_run(
            SyncError::new(SyncErrorCode::IncompatibleRemoteContent, "old content")
                .with_resource(SyncResource::Settings),
        );
        let mut h = start(collab, enabled_config());

        let err = next(&mut h.errors).await;
        assert_eq!(err.code, SyncErrorCode::IncompatibleRemoteContent);
        assert_eq!(err.resource, Some(SyncResource::Settings));
        assert!(!h.coordinator.enablement().is_enabled());
        assert!(!h.coordinator.has_pending_machine_removal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_per_error_code() {
        // (code, still enabled, immediate removals, delayed removal armed)
        let cases = [
            (SyncErrorCode::SessionExpired, false, 0, false),
            (SyncErrorCode::TurnedOff, false, 1, false),
            (SyncErrorCode::TooManyRequests, false, 0, true),
            (SyncErrorCode::LocalTooManyRequests, false, 0, true),
            (SyncErrorCode::UpgradeRequired, false, 0, true),
            (SyncErrorCode::Gone, false, 0, true),
            (SyncErrorCode::IncompatibleLocalContent, false, 1, false),
            (SyncErrorCode::IncompatibleRemoteContent, false, 1, false),
            (SyncErrorCode::Unauthorized, true, 0, false),
            (SyncErrorCode::Unknown, true, 0, false),
        ];

        for (code, enabled, removals, pending_removal) in cases {
            let collab = collaborators();
            collab
                .sync
                .fail_next_run(SyncError::new(code, "pass failed"));
            let mut h = start(collab, enabled_config());

            assert_eq!(next(&mut h.errors).await.code, code);
            assert_eq!(
                h.coordinator.enablement().is_enabled(),
                enabled,
                "enablement after {}",
                code
            );
            assert_eq!(
                h.collab.machines.removals(),
                removals,
                "removals after {}",
                code
            );
            assert_eq!(
                h.coordinator.has_pending_machine_removal(),
                pending_removal,
                "pending removal after {}",
                code
            );

            h.coordinator.shutdown().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_trigger_delay_keeps_running() {
        let mut config = enabled_config();
        config.trigger_delay = Duration::MAX;
        let collab = collaborators();
        collab
            .sync
            .fail_next_run(SyncError::new(SyncErrorCode::Unknown, "pass failed"));
        let mut h = start(collab, config);
        assert_eq!(next(&mut h.started).await, SyncTrigger::interval());
        assert_eq!(next(&mut h.errors).await.code, SyncErrorCode::Unknown);

        h.coordinator
            .trigger_sync(trigger(&["settings"]), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Running);
        assert_quiet(&mut h.started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_required_removes_machine_after_delay() {
        let collab = collaborators();
        collab.machines.insert(this_machine(false));
        collab
            .sync
            .fail_next_run(SyncError::new(SyncErrorCode::UpgradeRequired, "upgrade"));
        let mut h = start(collab, enabled_config());

        assert_eq!(next(&mut h.errors).await.code, SyncErrorCode::UpgradeRequired);
        assert_eq!(h.collab.machines.snapshot().len(), 1);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(h.collab.machines.removals(), 1);
        assert!(h.collab.machines.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_disabled_elsewhere_turns_off() {
        let collab = collaborators();
        collab.machines.insert(this_machine(true));
        let mut h = start(collab, enabled_config());

        assert_eq!(next(&mut h.errors).await.code, SyncErrorCode::TurnedOff);
        assert!(!h.coordinator.enablement().is_enabled());
        assert_eq!(h.collab.machines.removals(), 1);
        assert_eq!(h.collab.sync.runs_started(), 0);
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_data_deleted_turns_off() {
        let collab = collaborators();
        collab.sync.set_previously_synced(true);
        let mut h = start(collab, enabled_config());

        assert_eq!(next(&mut h.errors).await.code, SyncErrorCode::TurnedOff);
        assert!(!h.coordinator.enablement().is_enabled());
        assert_eq!(h.collab.sync.local_resets(), 1);
        assert!(!h.coordinator.has_pending_machine_removal());
        assert_eq!(h.collab.sync.runs_started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_removal_resumes_on_start() {
        let collab = collaborators();
        collab
            .storage
            .set_bool(keys::DISABLE_MACHINE_EVENTUALLY, true)
            .unwrap();
        let h = start(collab, AutoSyncConfig::default());

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(h.collab.machines.removals(), 1);
        assert!(!h.coordinator.has_pending_machine_removal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_pending_removal() {
        let collab = collaborators();
        collab
            .storage
            .set_bool(keys::DISABLE_MACHINE_EVENTUALLY, true)
            .unwrap();
        let h = start(collab, AutoSyncConfig::default());

        tokio::time::sleep(Duration::from_secs(60)).await;
        h.coordinator.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(h.collab.machines.removals(), 0);
        assert!(h.coordinator.has_pending_machine_removal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_enablement_starts_runner() {
        let storage = Arc::new(MemoryStore::new());
        let collab = MemoryCollaborators::new(
            MachineId::new("this-machine").unwrap(),
            storage.clone(),
        );
        let mut h = start(collab, AutoSyncConfig::default());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Disabled);

        storage.apply_external(keys::ENABLEMENT, Some("true"));
        assert_eq!(next(&mut h.started).await, SyncTrigger::interval());
        assert_eq!(h.coordinator.status().await.unwrap(), AutoSyncStatus::Running);
    }
}
