//! vaultsync: keep a vault of text documents in sync with a shared store.
//!
//! `run` watches a vault and syncs continuously; `sync` performs one manual
//! pass; `serve` hosts the document store other replicas connect to.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vaultsync_daemon::native_fs::NativeFs;
use vaultsync_daemon::persistence::{StateStorage, STATE_DIR};
use vaultsync_daemon::store_client::RemoteStoreClient;
use vaultsync_daemon::store_server::StoreServer;
use vaultsync_daemon::watcher::{FileEventKind, VaultWatcher};

use vaultsync_core::{
    EventBus, ExclusionFilter, ReplicaId, Subscription, SyncEngine, SyncEvent, SyncSettings,
};

#[derive(Parser, Debug)]
#[command(name = "vaultsync")]
#[command(about = "Bidirectional vault <-> shared store synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, watch the vault, and sync continuously
    Run {
        /// Path to the vault directory
        #[arg(short, long)]
        vault: PathBuf,

        /// Store address override (persisted to settings)
        #[arg(long)]
        store: Option<String>,

        /// Sweep interval override in seconds (persisted to settings)
        #[arg(long)]
        interval: Option<u64>,

        /// Additional exclusion patterns (persisted to settings)
        #[arg(long = "exclude")]
        exclusions: Vec<String>,
    },
    /// Run one manual sync pass and exit
    Sync {
        /// Path to the vault directory
        #[arg(short, long)]
        vault: PathBuf,

        /// Store address override (persisted to settings)
        #[arg(long)]
        store: Option<String>,
    },
    /// Serve a document store for replicas to connect to
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:9470")]
        listen: String,

        /// Directory for store snapshots (in-memory only when omitted)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,vaultsync_daemon=debug,vaultsync_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run {
            vault,
            store,
            interval,
            exclusions,
        } => run(vault, store, interval, exclusions).await,
        Command::Sync { vault, store } => sync_once(vault, store).await,
        Command::Serve { listen, data_dir } => serve(listen, data_dir).await,
    }
}

/// Merge CLI overrides into persisted settings, saving when changed.
fn apply_overrides(
    storage: &mut StateStorage,
    store: Option<String>,
    interval: Option<u64>,
    exclusions: Vec<String>,
) -> Result<SyncSettings> {
    let mut settings = storage.settings().clone();
    let mut changed = false;

    if let Some(address) = store {
        if settings.store_address != address {
            settings.store_address = address;
            changed = true;
        }
    }
    if let Some(secs) = interval {
        if settings.sync_interval_secs != secs {
            settings.sync_interval_secs = secs;
            changed = true;
        }
    }
    for pattern in exclusions {
        if !settings.exclusions.contains(&pattern) {
            settings.exclusions.push(pattern);
            changed = true;
        }
    }

    if changed {
        storage.update_settings(settings.clone())?;
    }
    Ok(settings)
}

fn build_engine(
    vault: &Path,
    replica: ReplicaId,
    settings: &SyncSettings,
) -> Result<SyncEngine<NativeFs>> {
    let mut patterns = settings.exclusions.clone();
    // The local state directory never participates in sync
    patterns.push(format!("{STATE_DIR}/**"));
    let filter = ExclusionFilter::new(&patterns)?;

    Ok(SyncEngine::new(
        NativeFs::new(vault.to_path_buf()),
        replica,
        filter,
        Duration::from_secs(settings.sync_interval_secs.max(1)),
        settings.auto_sync,
    ))
}

/// Surface engine notifications as log lines.
fn subscribe_notices(events: &Arc<EventBus>) -> Subscription {
    events.subscribe(|event| match event {
        SyncEvent::Connected { replica } => info!("Connected as replica {}", replica),
        SyncEvent::Disconnected => info!("Disconnected"),
        SyncEvent::SyncCompleted {
            uploaded,
            unchanged,
            materialized,
            failed,
        } => info!(
            "Sync pass: {} uploaded, {} unchanged, {} materialized, {} failed",
            uploaded, unchanged, materialized, failed
        ),
        SyncEvent::ConflictDiscarded { path, .. } => {
            info!("Kept local edit of {} (newer than remote)", path)
        }
        SyncEvent::SyncFailed { path, message } => warn!("Sync of {} failed: {}", path, message),
        SyncEvent::FeedWarning { message } => warn!("Change feed warning: {}", message),
        _ => {}
    })
}

async fn connect_engine(
    vault: &Path,
    store_override: Option<String>,
    interval: Option<u64>,
    exclusions: Vec<String>,
) -> Result<(SyncEngine<NativeFs>, Subscription)> {
    let mut storage = StateStorage::open(vault)?;
    let settings = apply_overrides(&mut storage, store_override, interval, exclusions)?;
    let replica = storage.vault_id();

    let engine = build_engine(vault, replica, &settings)?;
    let notices = subscribe_notices(engine.events());

    info!(
        "Connecting to {} ({}.{})",
        settings.store_address, settings.database, settings.collection
    );
    let client = RemoteStoreClient::connect(
        &settings.store_address,
        &replica,
        &settings.database,
        &settings.collection,
    )
    .await?;

    let report = engine.connect(Arc::new(client)).await?;
    info!(
        "Initial reconciliation: {} uploaded, {} unchanged, {} materialized, {} failed",
        report.uploaded, report.unchanged, report.materialized, report.failed
    );

    Ok((engine, notices))
}

async fn run(
    vault: PathBuf,
    store: Option<String>,
    interval: Option<u64>,
    exclusions: Vec<String>,
) -> Result<()> {
    let (engine, _notices) = connect_engine(&vault, store, interval, exclusions).await?;

    let mut watcher = VaultWatcher::new(vault.clone())?;
    info!("Watching {:?}. Press Ctrl+C to stop.", vault);

    loop {
        tokio::select! {
            Some(event) = watcher.event_rx().recv() => {
                match event.kind {
                    FileEventKind::Modified => engine.on_file_modified(&event.path).await,
                    FileEventKind::Deleted => engine.on_file_deleted(&event.path).await,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    engine.disconnect().await;
    Ok(())
}

async fn sync_once(vault: PathBuf, store: Option<String>) -> Result<()> {
    let (engine, _notices) = connect_engine(&vault, store, None, Vec::new()).await?;
    engine.disconnect().await;
    Ok(())
}

async fn serve(listen: String, data_dir: Option<PathBuf>) -> Result<()> {
    let server = StoreServer::new(data_dir);
    let listener = StoreServer::bind(&listen).await?;
    info!("Store server running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => server.accept(stream, addr).await,
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
