//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection. Events
//! carry vault-relative `/`-separated paths. The debouncer cannot report
//! renames; hosts whose notification API does call the engine's rename
//! handlers directly, while this watcher surfaces a rename as a delete of
//! the old path plus a modify of the new one.

use crate::persistence::STATE_DIR;
use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File event from the watcher.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path relative to vault root
    pub path: String,
    /// Type of event
    pub kind: FileEventKind,
}

/// Type of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Track last seen mtime to filter spurious events (some mounts re-report
/// unchanged files).
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// File watcher that monitors the vault directory.
pub struct VaultWatcher {
    /// Vault base path
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Receiver for file events
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl VaultWatcher {
    /// Create a new file watcher for the vault.
    ///
    /// Uses a 200ms debounce period to avoid rapid-fire events during saves.
    pub fn new(vault_path: PathBuf) -> Result<Self> {
        // Canonicalize to resolve symlinks; on macOS /var/folders/... is
        // really /private/var/folders/... and FSEvents needs the real path.
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let base = vault_path.clone();

        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));
        let cache = Arc::clone(&mtime_cache);

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) = Self::process_event(&event, &base, &cache) {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Process a single debounced event, returning a FileEvent if relevant.
    fn process_event(
        event: &DebouncedEvent,
        vault_path: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let path = &event.path;

        let relative = path.strip_prefix(vault_path).ok()?;
        let relative_str = relative.to_str()?.replace('\\', "/");

        if Self::is_ignored(&relative_str) {
            return None;
        }

        // The debouncer collapses event kinds; existence decides the kind.
        let kind = if path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };

        // For modifications, compare mtimes to filter spurious re-reports.
        // Uses the relative path as key so the cache is bounded by vault size.
        let relative_path = relative.to_path_buf();
        if kind == FileEventKind::Modified {
            if let Ok(metadata) = std::fs::metadata(path) {
                // Only files sync; folder structure rides along with them
                if metadata.is_dir() {
                    return None;
                }
                if let Ok(mtime) = metadata.modified() {
                    let mut cache = mtime_cache.lock().expect("mtime cache mutex poisoned");
                    if cache.get(&relative_path) == Some(&mtime) {
                        // Mtime unchanged - spurious event, skip it
                        return None;
                    }
                    cache.insert(relative_path, mtime);
                }
            }
        } else {
            let mut cache = mtime_cache.lock().expect("mtime cache mutex poisoned");
            cache.remove(&relative_path);
        }

        debug!("File event: {:?} - {}", kind, relative_str);

        Some(FileEvent {
            path: relative_str,
            kind,
        })
    }

    /// Paths the watcher never reports: the local sync state and dot-files.
    fn is_ignored(relative: &str) -> bool {
        if relative.is_empty() {
            return true;
        }
        if relative == STATE_DIR || relative.starts_with(&format!("{STATE_DIR}/")) {
            return true;
        }
        relative.starts_with('.') || relative.contains("/.")
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    /// Get the vault path.
    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn test_is_ignored() {
        assert!(VaultWatcher::is_ignored(".vaultsync/state.json"));
        assert!(VaultWatcher::is_ignored(".vaultsync"));
        assert!(VaultWatcher::is_ignored(".hidden"));
        assert!(VaultWatcher::is_ignored("notes/.hidden"));
        assert!(!VaultWatcher::is_ignored("notes/a.md"));
        assert!(!VaultWatcher::is_ignored("a.md"));
        assert!(!VaultWatcher::is_ignored("attachments/img.png"));
    }

    #[tokio::test]
    async fn test_watcher_reports_writes() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut watcher = VaultWatcher::new(temp.path().to_path_buf()).unwrap();

        // Give the backend a moment to become ready before writing
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(watcher.vault_path().join("note.md"), "# Note").unwrap();

        let event = timeout(Duration::from_secs(5), watcher.event_rx().recv())
            .await
            .expect("timed out waiting for watcher event")
            .expect("watcher channel closed");

        assert_eq!(event.path, "note.md");
        assert_eq!(event.kind, FileEventKind::Modified);
    }
}
