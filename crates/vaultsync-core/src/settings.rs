//! User-configurable sync settings.
//!
//! Persisted by the host alongside the replica identity; the core only
//! defines the shape and defaults.

use serde::{Deserialize, Serialize};

/// Settings controlling how a vault syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Address of the remote store.
    pub store_address: String,
    /// Database name the vault's documents live in.
    pub database: String,
    /// Collection name within the database.
    pub collection: String,
    /// Whether the periodic sweep runs while connected.
    pub auto_sync: bool,
    /// Interval between periodic sweeps, in seconds.
    pub sync_interval_secs: u64,
    /// Exclusion patterns (`**` any depth, `*` single segment).
    pub exclusions: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            store_address: "ws://127.0.0.1:9470".to_string(),
            database: "vaultsync".to_string(),
            collection: "documents".to_string(),
            auto_sync: true,
            sync_interval_secs: 60,
            exclusions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::default();
        assert!(settings.auto_sync);
        assert_eq!(settings.sync_interval_secs, 60);
        assert!(settings.exclusions.is_empty());
    }

    #[test]
    fn test_serde_roundtrip() {
        let settings = SyncSettings {
            exclusions: vec![".obsidian/**".into()],
            sync_interval_secs: 30,
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: SyncSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: SyncSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, SyncSettings::default());
    }
}
