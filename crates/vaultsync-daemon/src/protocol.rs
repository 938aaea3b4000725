//! Store wire protocol.
//!
//! A connection opens with a JSON hello sent as a binary WebSocket frame;
//! everything after that is bincode: `StoreRequest` frames from the client,
//! `StoreReply` frames from the server. Replies carry the request's id;
//! `Change` frames are unsolicited and arrive after a `Subscribe`.

use serde::{Deserialize, Serialize};
use vaultsync_core::{ChangeEvent, DocumentRecord};

/// Maximum frame size (50MB) to prevent memory exhaustion from misbehaving
/// clients.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

/// Hello message sent by a client right after the WebSocket upgrade.
///
/// Sent as a binary WebSocket frame containing UTF-8 JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Always "hello"
    #[serde(rename = "type")]
    pub msg_type: String,

    /// The connecting replica's identity
    #[serde(rename = "vaultId")]
    pub vault_id: String,

    /// Database the vault's documents live in
    pub database: String,

    /// Collection within the database
    pub collection: String,
}

impl HelloMessage {
    pub fn new(vault_id: &str, database: &str, collection: &str) -> Self {
        Self {
            msg_type: "hello".to_string(),
            vault_id: vault_id.to_string(),
            database: database.to_string(),
            collection: collection.to_string(),
        }
    }

    /// The server-side namespace this connection operates on.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    /// Serialize to UTF-8 JSON bytes for sending as a binary frame.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("HelloMessage serialization should not fail")
    }

    /// Try to parse a hello from binary data.
    ///
    /// Returns None if the data is not valid UTF-8 JSON or not a hello.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let msg: Self = serde_json::from_str(text).ok()?;
        if msg.msg_type == "hello" { Some(msg) } else { None }
    }
}

/// Quick check if data looks like a JSON hello (starts with '{').
///
/// Binary request/reply frames (bincode) won't start with '{'.
pub fn is_likely_hello(data: &[u8]) -> bool {
    data.first() == Some(&b'{')
}

/// Client → server request. Each carries the caller's request id and the
/// partition key it operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreRequest {
    Upsert {
        id: u64,
        path: String,
        content: String,
        mtime: u64,
        size: u64,
        hash: String,
        vault_id: String,
    },
    Delete {
        id: u64,
        path: String,
        vault_id: String,
    },
    Rename {
        id: u64,
        old_path: String,
        new_path: String,
        vault_id: String,
    },
    FindAll {
        id: u64,
        vault_id: String,
    },
    Subscribe {
        id: u64,
        exclude_vault_id: String,
    },
}

impl StoreRequest {
    pub fn id(&self) -> u64 {
        match self {
            StoreRequest::Upsert { id, .. }
            | StoreRequest::Delete { id, .. }
            | StoreRequest::Rename { id, .. }
            | StoreRequest::FindAll { id, .. }
            | StoreRequest::Subscribe { id, .. } => *id,
        }
    }
}

/// Server → client reply. `Change` frames have no request id; they belong
/// to the connection's active subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreReply {
    Ack { id: u64 },
    Documents { id: u64, documents: Vec<DocumentRecord> },
    Failed { id: u64, message: String },
    Change { event: ChangeEvent },
}

impl StoreReply {
    /// The request id this reply answers, if it answers one.
    pub fn id(&self) -> Option<u64> {
        match self {
            StoreReply::Ack { id }
            | StoreReply::Documents { id, .. }
            | StoreReply::Failed { id, .. } => Some(*id),
            StoreReply::Change { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let msg = HelloMessage::new("a1b2c3d4e5f67890", "vaultsync", "documents");
        let binary = msg.to_binary();
        let parsed = HelloMessage::from_binary(&binary).unwrap();

        assert_eq!(parsed.msg_type, "hello");
        assert_eq!(parsed.vault_id, "a1b2c3d4e5f67890");
        assert_eq!(parsed.namespace(), "vaultsync.documents");
    }

    #[test]
    fn test_is_likely_hello() {
        let hello = HelloMessage::new("abc", "db", "col").to_binary();
        assert!(is_likely_hello(&hello));

        // Bincode request frames don't start with '{'
        let request = StoreRequest::FindAll {
            id: 1,
            vault_id: "abc".into(),
        };
        let frame = bincode::serialize(&request).unwrap();
        assert!(!is_likely_hello(&frame));
    }

    #[test]
    fn test_invalid_json_returns_none() {
        assert!(HelloMessage::from_binary(b"not json at all").is_none());
    }

    #[test]
    fn test_non_hello_json_returns_none() {
        let other = b"{\"type\": \"other\", \"data\": 123}";
        assert!(HelloMessage::from_binary(other).is_none());
    }

    #[test]
    fn test_request_roundtrip() {
        let request = StoreRequest::Upsert {
            id: 7,
            path: "a.md".into(),
            content: "# A".into(),
            mtime: 1000,
            size: 3,
            hash: "ff".into(),
            vault_id: "0000000000000001".into(),
        };
        let frame = bincode::serialize(&request).unwrap();
        let parsed: StoreRequest = bincode::deserialize(&frame).unwrap();
        assert_eq!(parsed.id(), 7);
        assert!(matches!(parsed, StoreRequest::Upsert { .. }));
    }

    #[test]
    fn test_reply_ids() {
        assert_eq!(StoreReply::Ack { id: 3 }.id(), Some(3));
        assert_eq!(
            StoreReply::Failed {
                id: 4,
                message: "x".into()
            }
            .id(),
            Some(4)
        );
        let change = StoreReply::Change {
            event: ChangeEvent::Delete {
                path: "a.md".into(),
                vault_id: "0000000000000001".into(),
            },
        };
        assert_eq!(change.id(), None);
    }
}
