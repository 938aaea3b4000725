//! SyncEngine: the orchestrator for bidirectional vault/store sync.
//!
//! Three entry points feed the engine and may interleave freely: local
//! file events (from the host's watcher), the remote change feed, and the
//! periodic sweep. All converge on the same per-document decision logic.
//!
//! Loop freedom is structural, not event-suppressed: the change feed
//! excludes this replica's own writes, so a remote change applied locally
//! may raise a local file event and re-upload identical content, an
//! idempotent upsert the feed will not echo back.
//!
//! Conflicts are resolved at whole-document granularity, last writer wins,
//! keyed on the file's own modification time rather than record
//! bookkeeping timestamps, so a local edit made while offline is not
//! clobbered on reconnect.

use crate::events::{EventBus, SyncEvent};
use crate::exclusion::ExclusionFilter;
use crate::fingerprint::Fingerprint;
use crate::fs::{FileSystem, FsError};
use crate::paths;
use crate::record::{DocumentMeta, DocumentRecord};
use crate::replica::ReplicaId;
use crate::scheduler::SyncScheduler;
use crate::store::{ChangeEvent, ChangeFeed, RemoteStore, StoreError};

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Not connected to a store")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Connection lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Counters from a reconciliation or sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Local files uploaded to the store.
    pub uploaded: usize,
    /// Local files skipped because the remote fingerprint matched.
    pub unchanged: usize,
    /// Remote documents written into the local vault.
    pub materialized: usize,
    /// Documents whose propagation failed (logged, batch continued).
    pub failed: usize,
}

/// Everything the engine's background tasks need, shared by `Arc`.
pub(crate) struct SyncContext<F> {
    pub(crate) fs: F,
    pub(crate) replica: ReplicaId,
    pub(crate) filter: ExclusionFilter,
    pub(crate) events: Arc<EventBus>,
}

/// Exclusively-owned connection resources. At most one of each is live;
/// reconnecting tears all of them down first.
struct ActiveConnection {
    store: Arc<dyn RemoteStore>,
    feed_task: JoinHandle<()>,
    scheduler: Option<SyncScheduler>,
}

/// The sync engine for one vault replica.
pub struct SyncEngine<F: FileSystem> {
    ctx: Arc<SyncContext<F>>,
    interval: Duration,
    auto_sync: bool,
    conn: Mutex<Option<ActiveConnection>>,
    state: std::sync::RwLock<ConnectionState>,
}

impl<F: FileSystem + 'static> SyncEngine<F> {
    pub fn new(
        fs: F,
        replica: ReplicaId,
        filter: ExclusionFilter,
        interval: Duration,
        auto_sync: bool,
    ) -> Self {
        Self {
            ctx: Arc::new(SyncContext {
                fs,
                replica,
                filter,
                events: Arc::new(EventBus::new()),
            }),
            interval,
            auto_sync,
            conn: Mutex::new(None),
            state: std::sync::RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.ctx.events
    }

    pub fn replica(&self) -> ReplicaId {
        self.ctx.replica
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Connect to a store: subscribe to its change feed, run the initial
    /// reconciliation, and start the periodic sweep.
    ///
    /// The `conn` mutex serializes connect attempts; a second connect while
    /// one is active returns `AlreadyConnected`. Any failure during
    /// establishment leaves the engine `Disconnected` and surfaces the
    /// error to the caller.
    pub async fn connect(&self, store: Arc<dyn RemoteStore>) -> Result<SyncReport> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Err(EngineError::AlreadyConnected);
        }
        self.set_state(ConnectionState::Connecting);

        // Subscribe before reconciling so no remote write landing mid-pass
        // is missed; interleaved application is safe because every
        // operation is idempotent.
        let established = async {
            let feed = store.subscribe(&self.ctx.replica).await?;
            let report = self.ctx.reconcile(store.as_ref()).await?;
            Ok::<_, EngineError>((feed, report))
        }
        .await;

        let (feed, report) = match established {
            Ok(v) => v,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let feed_task = tokio::spawn(feed_loop(Arc::clone(&self.ctx), feed));

        let scheduler = if self.auto_sync {
            let ctx = Arc::clone(&self.ctx);
            let store = Arc::clone(&store);
            Some(SyncScheduler::start(self.interval, move || {
                let ctx = Arc::clone(&ctx);
                let store = Arc::clone(&store);
                async move {
                    match ctx.sweep(store.as_ref()).await {
                        Ok(report) => debug!(
                            uploaded = report.uploaded,
                            unchanged = report.unchanged,
                            failed = report.failed,
                            "Periodic sweep finished"
                        ),
                        Err(e) => warn!("Periodic sweep failed: {}", e),
                    }
                }
            }))
        } else {
            None
        };

        *conn = Some(ActiveConnection {
            store,
            feed_task,
            scheduler,
        });
        self.set_state(ConnectionState::Connected);
        self.ctx.events.emit(SyncEvent::Connected {
            replica: self.ctx.replica.to_string(),
        });
        info!(
            "Connected as replica {} ({} uploaded, {} unchanged, {} materialized)",
            self.ctx.replica, report.uploaded, report.unchanged, report.materialized
        );
        Ok(report)
    }

    /// Disconnect from the store. Idempotent.
    pub async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(active) = conn.take() {
            // Teardown order matters: feed first, then the timer, then the
            // store handle, so neither callback fires against a released
            // connection.
            active.feed_task.abort();
            if let Some(scheduler) = &active.scheduler {
                scheduler.stop();
            }
            drop(active);
            self.set_state(ConnectionState::Disconnected);
            self.ctx.events.emit(SyncEvent::Disconnected);
            info!("Disconnected from store");
        }
    }

    /// Run a full reconciliation pass now. Safe to re-run at any time.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let store = self.store_handle().await.ok_or(EngineError::NotConnected)?;
        self.ctx.reconcile(store.as_ref()).await
    }

    /// A new local file appeared.
    pub async fn on_file_created(&self, path: &str) {
        self.on_file_modified(path).await;
    }

    /// A local file changed. Uploads unconditionally; fingerprint
    /// suppression runs only in the reconciliation passes, so conflict
    /// timing matches the event stream.
    pub async fn on_file_modified(&self, path: &str) {
        if self.ctx.filter.matches(path) {
            return;
        }
        let Some(store) = self.store_handle().await else {
            return;
        };
        if let Err(e) = self.ctx.upload(store.as_ref(), path).await {
            self.ctx.report_failure(path, &e);
        }
    }

    /// A local file was deleted.
    pub async fn on_file_deleted(&self, path: &str) {
        if self.ctx.filter.matches(path) {
            return;
        }
        let Some(store) = self.store_handle().await else {
            return;
        };
        if let Err(e) = store.delete(path, &self.ctx.replica).await {
            self.ctx.report_failure(path, &e.into());
        }
    }

    /// A local file moved. When the rename crosses the exclusion boundary
    /// the remote side only ever sees the included half.
    pub async fn on_file_renamed(&self, old_path: &str, new_path: &str) {
        let Some(store) = self.store_handle().await else {
            return;
        };
        let result = match (
            self.ctx.filter.matches(old_path),
            self.ctx.filter.matches(new_path),
        ) {
            (true, true) => return,
            (true, false) => self.ctx.upload(store.as_ref(), new_path).await,
            (false, true) => store
                .delete(old_path, &self.ctx.replica)
                .await
                .map_err(EngineError::from),
            (false, false) => store
                .rename(old_path, new_path, &self.ctx.replica)
                .await
                .map_err(EngineError::from),
        };
        if let Err(e) = result {
            self.ctx.report_failure(old_path, &e);
        }
    }

    /// A local folder moved: rewrite every stored path under it.
    pub async fn on_folder_renamed(&self, old_prefix: &str, new_prefix: &str) {
        let Some(store) = self.store_handle().await else {
            return;
        };
        match self
            .ctx
            .propagate_folder_rename(store.as_ref(), old_prefix, new_prefix)
            .await
        {
            Ok(count) => info!(
                "Folder rename {} -> {}: rewrote {} record(s)",
                old_prefix, new_prefix, count
            ),
            Err(e) => self.ctx.report_failure(old_prefix, &e),
        }
    }

    async fn store_handle(&self) -> Option<Arc<dyn RemoteStore>> {
        self.conn.lock().await.as_ref().map(|c| Arc::clone(&c.store))
    }
}

/// Drives the remote→local path until the feed ends or the task is aborted.
async fn feed_loop<F: FileSystem>(ctx: Arc<SyncContext<F>>, mut feed: ChangeFeed) {
    while let Some(item) = feed.next().await {
        match item {
            Ok(event) => ctx.apply_remote_change(&event).await,
            Err(e) => {
                warn!("Change feed error: {}", e);
                ctx.events.emit(SyncEvent::FeedWarning {
                    message: e.to_string(),
                });
            }
        }
    }
    debug!("Change feed closed");
}

impl<F: FileSystem> SyncContext<F> {
    /// Initial reconciliation: publish local state, then materialize
    /// remote-only documents. Local content always wins here; true
    /// conflict arbitration only happens on the remote→local path.
    pub(crate) async fn reconcile(&self, store: &dyn RemoteStore) -> Result<SyncReport> {
        let mut remote: HashMap<String, DocumentRecord> = store
            .find_all(&self.replica)
            .await?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        let mut report = SyncReport::default();
        for path in self.walk_files().await? {
            let record = remote.remove(&path);
            match self.publish_file(store, &path, record.as_ref()).await {
                Ok(true) => report.uploaded += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    self.report_failure(&path, &e);
                    report.failed += 1;
                }
            }
        }

        // Whatever is left in the map has no local counterpart.
        for (path, record) in remote {
            if self.filter.matches(&path) {
                continue;
            }
            match self.materialize(&record).await {
                Ok(true) => report.materialized += 1,
                Ok(false) => {}
                Err(e) => {
                    self.report_failure(&path, &e);
                    report.failed += 1;
                }
            }
        }

        self.emit_completed(&report);
        Ok(report)
    }

    /// The periodic backstop: local→remote only, fingerprint-gated. Never
    /// materializes remote documents.
    pub(crate) async fn sweep(&self, store: &dyn RemoteStore) -> Result<SyncReport> {
        let remote: HashMap<String, DocumentRecord> = store
            .find_all(&self.replica)
            .await?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        let mut report = SyncReport::default();
        for path in self.walk_files().await? {
            match self.publish_file(store, &path, remote.get(&path)).await {
                Ok(true) => report.uploaded += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    self.report_failure(&path, &e);
                    report.failed += 1;
                }
            }
        }

        self.emit_completed(&report);
        Ok(report)
    }

    /// Unconditional upload of one local file.
    pub(crate) async fn upload(&self, store: &dyn RemoteStore, path: &str) -> Result<()> {
        self.publish_file(store, path, None).await.map(|_| ())
    }

    /// Upload `path` unless `remote` already carries its fingerprint.
    /// Returns whether an upload happened.
    async fn publish_file(
        &self,
        store: &dyn RemoteStore,
        path: &str,
        remote: Option<&DocumentRecord>,
    ) -> Result<bool> {
        let content = self.fs.read(path).await?;
        let hash = Fingerprint::of_bytes(&content);
        if let Some(record) = remote {
            if hash.as_str() == record.hash {
                return Ok(false);
            }
        }

        let stat = self.fs.stat(path).await?;
        let text = String::from_utf8_lossy(&content).into_owned();
        store
            .upsert(
                path,
                &text,
                DocumentMeta {
                    mtime: stat.mtime_millis,
                    size: stat.size,
                    hash: hash.into_string(),
                },
                &self.replica,
            )
            .await?;
        debug!("Uploaded {}", path);
        self.events.emit(SyncEvent::DocumentUploaded {
            path: path.to_string(),
        });
        Ok(true)
    }

    /// Apply one incoming change from the feed. Errors are contained at
    /// the document boundary.
    pub(crate) async fn apply_remote_change(&self, event: &ChangeEvent) {
        let path = event.path();
        if self.filter.matches(path) {
            debug!("Ignoring remote change for excluded path {}", path);
            return;
        }
        let result = match event {
            ChangeEvent::Insert { document }
            | ChangeEvent::Update { document }
            | ChangeEvent::Replace { document } => self.apply_remote_document(document).await,
            ChangeEvent::Delete { .. } => self.apply_remote_delete(path).await,
        };
        if let Err(e) = result {
            self.report_failure(path, &e);
        }
    }

    async fn apply_remote_document(&self, document: &DocumentRecord) -> Result<()> {
        let path = &document.path;
        if self.fs.exists(path).await? {
            let stat = self.fs.stat(path).await?;
            // Strictly-newer local edit survives; equal or older takes the
            // remote content.
            if stat.mtime_millis > document.mtime {
                debug!(
                    "Keeping local {} (local mtime {} > remote {})",
                    path, stat.mtime_millis, document.mtime
                );
                self.events.emit(SyncEvent::ConflictDiscarded {
                    path: path.clone(),
                    local_mtime: stat.mtime_millis,
                    remote_mtime: document.mtime,
                });
                return Ok(());
            }
        } else {
            self.ensure_ancestors(path).await?;
        }
        self.fs.write(path, document.content.as_bytes()).await?;
        debug!("Applied remote change to {}", path);
        self.events.emit(SyncEvent::DocumentMaterialized { path: path.clone() });
        Ok(())
    }

    /// Remote deletes always propagate; they are terminal and not
    /// re-contested.
    async fn apply_remote_delete(&self, path: &str) -> Result<()> {
        if self.fs.exists(path).await? {
            self.fs.delete(path).await?;
            debug!("Applied remote delete of {}", path);
            self.events.emit(SyncEvent::DocumentRemoved {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Write a remote-only document into the vault, unless something
    /// already exists at its path. Returns whether a file was created.
    async fn materialize(&self, document: &DocumentRecord) -> Result<bool> {
        if self.fs.exists(&document.path).await? {
            return Ok(false);
        }
        self.ensure_ancestors(&document.path).await?;
        self.fs
            .write(&document.path, document.content.as_bytes())
            .await?;
        debug!("Materialized {}", document.path);
        self.events.emit(SyncEvent::DocumentMaterialized {
            path: document.path.clone(),
        });
        Ok(true)
    }

    /// Rewrite every stored path under `old_prefix`. Per-record rewrites
    /// are idempotent, so a partially applied batch converges on retry.
    pub(crate) async fn propagate_folder_rename(
        &self,
        store: &dyn RemoteStore,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<usize> {
        let records = store.find_all(&self.replica).await?;
        let mut rewritten = 0;
        for record in records {
            let Some(new_path) = paths::rebase_prefix(&record.path, old_prefix, new_prefix) else {
                continue;
            };
            if self.filter.matches(&new_path) {
                store.delete(&record.path, &self.replica).await?;
            } else {
                store.rename(&record.path, &new_path, &self.replica).await?;
            }
            rewritten += 1;
        }
        Ok(rewritten)
    }

    /// Create missing ancestor folders top-down. `mkdir` is treated as
    /// idempotent rather than pre-checked: another entry point may create
    /// the same folder between a check and the act.
    async fn ensure_ancestors(&self, path: &str) -> std::result::Result<(), FsError> {
        for dir in paths::ancestors(path) {
            match self.fs.mkdir(&dir).await {
                Ok(()) | Err(FsError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// All non-excluded files in the vault, sorted.
    async fn walk_files(&self) -> std::result::Result<Vec<String>, FsError> {
        let mut files = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(dir) = pending.pop() {
            for entry in self.fs.list(&dir).await? {
                let path = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir, entry.name)
                };
                if entry.is_dir {
                    pending.push(path);
                } else if !self.filter.matches(&path) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn emit_completed(&self, report: &SyncReport) {
        self.events.emit(SyncEvent::SyncCompleted {
            uploaded: report.uploaded,
            unchanged: report.unchanged,
            materialized: report.materialized,
            failed: report.failed,
        });
    }

    fn report_failure(&self, path: &str, error: &EngineError) {
        warn!("Sync of {} failed: {}", path, error);
        self.events.emit(SyncEvent::SyncFailed {
            path: path.to_string(),
            message: error.to_string(),
        });
    }
}
