//! Persisted local state: replica identity plus user settings.
//!
//! Stored as `.vaultsync/state.json` inside the vault directory. The
//! replica identity is generated on first open and written back
//! immediately; it is never regenerated afterwards.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use vaultsync_core::{ReplicaId, SyncSettings};

/// Directory inside the vault holding sync state. Never synced itself.
pub const STATE_DIR: &str = ".vaultsync";

/// The persisted blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    /// This installation's replica identity.
    pub vault_id: ReplicaId,
    /// User-configured sync settings.
    pub settings: SyncSettings,
}

/// Storage for the local state file.
pub struct StateStorage {
    path: PathBuf,
    state: LocalState,
}

impl StateStorage {
    /// Open (or initialize) the state for a vault.
    ///
    /// On first run this generates the replica identity and persists it
    /// before returning, so the identity is stable from the very first
    /// remote write onward.
    pub fn open(vault_path: &Path) -> Result<Self> {
        let path = vault_path.join(STATE_DIR).join("state.json");

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let state: LocalState = serde_json::from_str(&contents)?;
            Ok(Self { path, state })
        } else {
            let state = LocalState {
                vault_id: ReplicaId::generate(),
                settings: SyncSettings::default(),
            };
            let storage = Self { path, state };
            storage.save()?;
            info!("Generated replica identity {}", storage.state.vault_id);
            Ok(storage)
        }
    }

    /// Write the current state to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.state)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }

    pub fn vault_id(&self) -> ReplicaId {
        self.state.vault_id
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.state.settings
    }

    /// Replace the settings and persist.
    pub fn update_settings(&mut self, settings: SyncSettings) -> Result<()> {
        self.state.settings = settings;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_generated_and_persisted() {
        let temp = TempDir::new().unwrap();

        let first = StateStorage::open(temp.path()).unwrap();
        let id = first.vault_id();
        drop(first);

        // File exists and holds the same identity
        assert!(temp.path().join(STATE_DIR).join("state.json").exists());
        let second = StateStorage::open(temp.path()).unwrap();
        assert_eq!(second.vault_id(), id);
    }

    #[test]
    fn test_identity_stable_across_many_opens() {
        let temp = TempDir::new().unwrap();
        let id = StateStorage::open(temp.path()).unwrap().vault_id();
        for _ in 0..3 {
            assert_eq!(StateStorage::open(temp.path()).unwrap().vault_id(), id);
        }
    }

    #[test]
    fn test_settings_roundtrip() {
        let temp = TempDir::new().unwrap();

        {
            let mut storage = StateStorage::open(temp.path()).unwrap();
            let mut settings = storage.settings().clone();
            settings.exclusions.push(".obsidian/**".into());
            settings.sync_interval_secs = 30;
            storage.update_settings(settings).unwrap();
        }

        let storage = StateStorage::open(temp.path()).unwrap();
        assert_eq!(storage.settings().sync_interval_secs, 30);
        assert_eq!(storage.settings().exclusions, vec![".obsidian/**".to_string()]);
    }

    #[test]
    fn test_defaults_on_first_open() {
        let temp = TempDir::new().unwrap();
        let storage = StateStorage::open(temp.path()).unwrap();
        assert_eq!(*storage.settings(), SyncSettings::default());
    }
}
