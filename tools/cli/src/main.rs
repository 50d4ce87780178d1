//! usersync CLI - Command line interface for the auto-sync coordinator.
//!
//! This tool inspects and toggles the persisted sync state of an
//! installation and can run the coordinator against simulated services.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use usersync_common::{MachineId, SyncError, SyncErrorCode};
use usersync_storage::{FileStore, KeyValueStore};
use usersync_sync::session::keys;
use usersync_sync::{
    AutoSyncConfig, AutoSyncCoordinator, EnablementPolicy, MemoryCollaborators, SessionStore,
};

const STATE_FILE: &str = "state.json";
const CONFIG_FILE: &str = "config.json";
const MACHINE_ID_KEY: &str = "usersync.machineId";

#[derive(Parser)]
#[command(name = "usersync")]
#[command(about = "usersync - Automatic settings synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the persisted state (default: <config dir>/usersync).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Coordinator configuration file (default: <state dir>/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show enablement, session and machine state.
    Status,

    /// Turn sync on for this installation.
    Enable,

    /// Turn sync off for this installation.
    Disable,

    /// Run the coordinator against simulated services.
    Simulate {
        /// How long to run.
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,

        /// Number of activity triggers spread over the run.
        #[arg(short, long, default_value_t = 3)]
        triggers: u32,

        /// Fail the first pass with this error code, e.g. "too-many-requests".
        #[arg(short, long)]
        fail: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging, RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(cli.verbose)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine the configuration directory"))?
            .join("usersync"),
    };
    let config_path = cli
        .config
        .unwrap_or_else(|| state_dir.join(CONFIG_FILE));
    let config = AutoSyncConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match cli.command {
        Commands::Status => cmd_status(&state_dir, config),

        Commands::Enable => cmd_set_enabled(&state_dir, config, true),

        Commands::Disable => cmd_set_enabled(&state_dir, config, false),

        Commands::Simulate {
            seconds,
            triggers,
            fail,
        } => cmd_simulate(&state_dir, config, seconds, triggers, fail.as_deref()).await,
    }
}

/// Log level used when `RUST_LOG` is not set.
fn default_log_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Open the persisted state of the installation.
fn open_store(state_dir: &Path) -> Result<Arc<FileStore>> {
    let path = state_dir.join(STATE_FILE);
    let store = FileStore::open(&path)
        .with_context(|| format!("Failed to open state at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Machine id of this installation, generated on first use.
fn machine_id(store: &dyn KeyValueStore) -> Result<MachineId> {
    if let Some(id) = store.get(MACHINE_ID_KEY) {
        return Ok(MachineId::new(id)?);
    }
    let id = uuid::Uuid::new_v4().to_string();
    store.set(MACHINE_ID_KEY, &id)?;
    Ok(MachineId::new(id)?)
}

/// Show the persisted sync state.
fn cmd_status(state_dir: &Path, config: AutoSyncConfig) -> Result<()> {
    let store: Arc<dyn KeyValueStore> = open_store(state_dir)?;
    let machine = machine_id(store.as_ref())?;
    let enablement = EnablementPolicy::new(store.clone(), config.enablement);
    let sessions = SessionStore::new(store.clone());

    println!("Sync state:");
    println!("  Machine: {}", machine);
    println!("  Enabled: {}", enablement.is_enabled());
    match enablement.overridden() {
        Some(value) => println!("  Override: {}", value),
        None => println!("  Override: none"),
    }
    println!(
        "  Session: {}",
        sessions.session_id().unwrap_or_else(|| "none".to_string())
    );
    println!(
        "  Pending machine removal: {}",
        store
            .get_bool(keys::DISABLE_MACHINE_EVENTUALLY)
            .unwrap_or(false)
    );

    Ok(())
}

/// Toggle the persisted user preference.
fn cmd_set_enabled(state_dir: &Path, config: AutoSyncConfig, enabled: bool) -> Result<()> {
    let store: Arc<dyn KeyValueStore> = open_store(state_dir)?;
    let enablement = EnablementPolicy::new(store, config.enablement);

    info!("Setting sync enablement to {}", enabled);
    enablement
        .set_enabled(enabled)
        .context("Failed to change sync enablement")?;

    println!("Sync {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

/// Run the coordinator against in-memory services.
async fn cmd_simulate(
    state_dir: &Path,
    config: AutoSyncConfig,
    seconds: u64,
    triggers: u32,
    fail: Option<&str>,
) -> Result<()> {
    let store: Arc<dyn KeyValueStore> = open_store(state_dir)?;
    let machine = machine_id(store.as_ref())?;
    info!("Simulating auto sync for machine {}", machine);

    let collaborators = MemoryCollaborators::new(machine, store);
    if let Some(code) = fail {
        let code: SyncErrorCode = code.parse()?;
        collaborators
            .sync
            .fail_next_run(SyncError::new(code, "Simulated failure"));
    }

    let coordinator = AutoSyncCoordinator::start(collaborators.context(), config);
    println!("Status: {}", coordinator.status().await?);

    let mut started = coordinator.subscribe_sync_started();
    let mut finished = coordinator.subscribe_sync_finished();
    let mut errors = coordinator.subscribe_errors();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = started.recv() => match event {
                    Ok(trigger) if trigger.sources.is_empty() => {
                        println!("Sync started ({})", trigger.reason)
                    }
                    Ok(trigger) => println!(
                        "Sync started ({}: {})",
                        trigger.reason,
                        trigger.sources.join(", ")
                    ),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                event = finished.recv() => match event {
                    Ok(None) => println!("Sync finished"),
                    Ok(Some(err)) => println!("Sync failed: {}", err),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                event = errors.recv() => match event {
                    Ok(err) => println!("Error: {} [{}]", err.message, err.code),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let total = Duration::from_secs(seconds);
    let step = total / (triggers + 1);
    for i in 0..triggers {
        tokio::time::sleep(step).await;
        coordinator
            .trigger_sync(vec![format!("cli-{}", i + 1)], false)
            .await?;
    }
    tokio::time::sleep(total.saturating_sub(step * triggers)).await;

    println!("Status: {}", coordinator.status().await?);
    println!("Machines:");
    for machine in collaborators.machines.snapshot() {
        println!("  {} ({})", machine.name, machine.id);
    }

    coordinator.shutdown().await;
    printer.abort();
    Ok(())
}
