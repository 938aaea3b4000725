//! The document record: the unit of sync, one per path per replica.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One document as stored remotely.
///
/// `(path, vault_id)` is the replication key: each replica's view of a path
/// lives in its own logical partition. `mtime` is the document's own
/// file-system modification time in ms since epoch (the conflict-resolution
/// key), distinct from the `created_at`/`updated_at` record bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Logical location within the vault tree.
    pub path: String,
    /// Full document body.
    pub content: String,
    /// Last-modification time of the file itself, ms since epoch.
    pub mtime: u64,
    /// Byte length, informational.
    pub size: u64,
    /// Hex-encoded content fingerprint, used for change suppression.
    pub hash: String,
    /// Identity of the replica that last wrote this record.
    pub vault_id: String,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written (including path rewrites).
    pub updated_at: DateTime<Utc>,
}

/// File metadata accompanying an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMeta {
    /// File modification time, ms since epoch.
    pub mtime: u64,
    /// Byte length.
    pub size: u64,
    /// Hex-encoded content fingerprint.
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serde_field_names() {
        let record = DocumentRecord {
            path: "notes/a.md".into(),
            content: "# A".into(),
            mtime: 1000,
            size: 3,
            hash: "ab".into(),
            vault_id: "0000000000000001".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let json = serde_json::to_value(&record).unwrap();
        for field in [
            "path",
            "content",
            "mtime",
            "size",
            "hash",
            "vault_id",
            "created_at",
            "updated_at",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }

        let back: DocumentRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
