//! Remote store contract: document CRUD plus a subscribable change feed.
//!
//! The store partitions documents by `(path, vault_id)`: the replication
//! key, not a global identity. Subscriptions exclude the subscriber's own
//! `vault_id`; that predicate is what makes the sync loop-free, so a
//! replica never observes its own writes.
//!
//! `InMemoryStore` is the reference implementation, used by engine tests
//! and as the backing table of the daemon's store server.

use crate::record::{DocumentMeta, DocumentRecord};
use crate::replica::ReplicaId;
use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::RwLock;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Store rejected request: {0}")]
    Rejected(String),

    #[error("Change feed error: {0}")]
    Feed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A change delivered on the feed.
///
/// Non-delete variants always carry the full resulting document; delete
/// carries only the replication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    Insert { document: DocumentRecord },
    Update { document: DocumentRecord },
    Replace { document: DocumentRecord },
    Delete { path: String, vault_id: String },
}

impl ChangeEvent {
    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Insert { document }
            | ChangeEvent::Update { document }
            | ChangeEvent::Replace { document } => &document.path,
            ChangeEvent::Delete { path, .. } => path,
        }
    }

    pub fn vault_id(&self) -> &str {
        match self {
            ChangeEvent::Insert { document }
            | ChangeEvent::Update { document }
            | ChangeEvent::Replace { document } => &document.vault_id,
            ChangeEvent::Delete { vault_id, .. } => vault_id,
        }
    }

    /// The resulting document, for non-delete changes.
    pub fn document(&self) -> Option<&DocumentRecord> {
        match self {
            ChangeEvent::Insert { document }
            | ChangeEvent::Update { document }
            | ChangeEvent::Replace { document } => Some(document),
            ChangeEvent::Delete { .. } => None,
        }
    }
}

/// A live, ordered stream of change notifications.
///
/// Per-document ordering follows the store's write order; no ordering is
/// imposed across documents. The feed ends when the store connection goes
/// away; delivery errors surface as `Err` items without ending the feed.
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<Result<ChangeEvent>>,
}

impl ChangeFeed {
    /// Wrap a channel receiver as a feed. Store adapters push filtered
    /// events (or feed errors) into the sender half.
    pub fn new(rx: mpsc::UnboundedReceiver<Result<ChangeEvent>>) -> Self {
        Self { rx }
    }
}

impl Stream for ChangeFeed {
    type Item = Result<ChangeEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// The remote document store, scoped by owning replica.
///
/// All mutations are idempotent: repeating an upsert, delete, or rename
/// converges on the same state, so interleaved or retried batches are safe.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create-or-replace the record keyed by `(path, replica)`.
    async fn upsert(
        &self,
        path: &str,
        content: &str,
        meta: DocumentMeta,
        replica: &ReplicaId,
    ) -> Result<()>;

    /// Remove the record keyed by `(path, replica)`. Removing an absent
    /// record is a no-op.
    async fn delete(&self, path: &str, replica: &ReplicaId) -> Result<()>;

    /// Rewrite the record's path, keyed by the old path, bumping
    /// `updated_at`. Renaming an absent record is a no-op.
    async fn rename(&self, old_path: &str, new_path: &str, replica: &ReplicaId) -> Result<()>;

    /// All records in this replica's partition, ordered by path.
    async fn find_all(&self, replica: &ReplicaId) -> Result<Vec<DocumentRecord>>;

    /// Subscribe to changes for every partition EXCEPT `exclude`.
    async fn subscribe(&self, exclude: &ReplicaId) -> Result<ChangeFeed>;
}

struct FeedSubscriber {
    exclude: String,
    tx: mpsc::UnboundedSender<Result<ChangeEvent>>,
}

/// In-memory store with a working change feed.
pub struct InMemoryStore {
    documents: RwLock<BTreeMap<(String, String), DocumentRecord>>,
    subscribers: RwLock<Vec<FeedSubscriber>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Publish to every subscriber whose exclusion doesn't cover the event.
    /// Subscribers whose receiver is gone are dropped.
    fn publish(&self, event: ChangeEvent) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.retain(|sub| {
            if sub.exclude == event.vault_id() {
                true
            } else {
                sub.tx.send(Ok(event.clone())).is_ok()
            }
        });
    }

    /// Every record across all partitions, for persistence snapshots.
    pub fn snapshot(&self) -> Vec<DocumentRecord> {
        let docs = self.documents.read().unwrap_or_else(|e| e.into_inner());
        docs.values().cloned().collect()
    }

    /// Load records wholesale, replacing current contents. Does not notify
    /// subscribers; intended for startup restore before any subscription.
    pub fn restore(&self, records: Vec<DocumentRecord>) {
        let mut docs = self.documents.write().unwrap_or_else(|e| e.into_inner());
        docs.clear();
        for record in records {
            docs.insert((record.path.clone(), record.vault_id.clone()), record);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn upsert(
        &self,
        path: &str,
        content: &str,
        meta: DocumentMeta,
        replica: &ReplicaId,
    ) -> Result<()> {
        let vault_id = replica.to_string();
        let key = (path.to_string(), vault_id.clone());
        let now = Utc::now();

        let event = {
            let mut docs = self.documents.write().unwrap_or_else(|e| e.into_inner());
            match docs.get_mut(&key) {
                Some(existing) => {
                    existing.content = content.to_string();
                    existing.mtime = meta.mtime;
                    existing.size = meta.size;
                    existing.hash = meta.hash;
                    existing.updated_at = now;
                    ChangeEvent::Update {
                        document: existing.clone(),
                    }
                }
                None => {
                    let record = DocumentRecord {
                        path: path.to_string(),
                        content: content.to_string(),
                        mtime: meta.mtime,
                        size: meta.size,
                        hash: meta.hash,
                        vault_id,
                        created_at: now,
                        updated_at: now,
                    };
                    docs.insert(key, record.clone());
                    ChangeEvent::Insert { document: record }
                }
            }
        };

        self.publish(event);
        Ok(())
    }

    async fn delete(&self, path: &str, replica: &ReplicaId) -> Result<()> {
        let vault_id = replica.to_string();
        let removed = {
            let mut docs = self.documents.write().unwrap_or_else(|e| e.into_inner());
            docs.remove(&(path.to_string(), vault_id.clone())).is_some()
        };

        if removed {
            self.publish(ChangeEvent::Delete {
                path: path.to_string(),
                vault_id,
            });
        }
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str, replica: &ReplicaId) -> Result<()> {
        let vault_id = replica.to_string();
        let event = {
            let mut docs = self.documents.write().unwrap_or_else(|e| e.into_inner());
            match docs.remove(&(old_path.to_string(), vault_id.clone())) {
                Some(mut record) => {
                    record.path = new_path.to_string();
                    record.updated_at = Utc::now();
                    docs.insert((new_path.to_string(), vault_id), record.clone());
                    Some(ChangeEvent::Update { document: record })
                }
                None => None,
            }
        };

        if let Some(event) = event {
            self.publish(event);
        }
        Ok(())
    }

    async fn find_all(&self, replica: &ReplicaId) -> Result<Vec<DocumentRecord>> {
        let vault_id = replica.to_string();
        let docs = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs
            .values()
            .filter(|record| record.vault_id == vault_id)
            .cloned()
            .collect())
    }

    async fn subscribe(&self, exclude: &ReplicaId) -> Result<ChangeFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.push(FeedSubscriber {
            exclude: exclude.to_string(),
            tx,
        });
        Ok(ChangeFeed::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use futures::StreamExt;

    fn meta(content: &str, mtime: u64) -> DocumentMeta {
        DocumentMeta {
            mtime,
            size: content.len() as u64,
            hash: Fingerprint::of_text(content).into_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_find_all() {
        let store = InMemoryStore::new();
        let replica = ReplicaId::from(1);

        store
            .upsert("a.md", "# A", meta("# A", 100), &replica)
            .await
            .unwrap();

        let records = store.find_all(&replica).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "a.md");
        assert_eq!(records[0].content, "# A");
        assert_eq!(records[0].mtime, 100);
        assert_eq!(records[0].vault_id, replica.to_string());
    }

    #[tokio::test]
    async fn test_upsert_is_create_or_replace() {
        let store = InMemoryStore::new();
        let replica = ReplicaId::from(1);

        store
            .upsert("a.md", "v1", meta("v1", 100), &replica)
            .await
            .unwrap();
        let first = store.find_all(&replica).await.unwrap().remove(0);

        store
            .upsert("a.md", "v2", meta("v2", 200), &replica)
            .await
            .unwrap();
        let records = store.find_all(&replica).await.unwrap();

        // Still one record: replaced in place, creation time preserved
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "v2");
        assert_eq!(records[0].mtime, 200);
        assert_eq!(records[0].created_at, first.created_at);
        assert!(records[0].updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = InMemoryStore::new();
        let a = ReplicaId::from(1);
        let b = ReplicaId::from(2);

        store.upsert("n.md", "A's", meta("A's", 1), &a).await.unwrap();
        store.upsert("n.md", "B's", meta("B's", 2), &b).await.unwrap();

        let for_a = store.find_all(&a).await.unwrap();
        let for_b = store.find_all(&b).await.unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].content, "A's");
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].content, "B's");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryStore::new();
        let replica = ReplicaId::from(1);

        store.upsert("a.md", "x", meta("x", 1), &replica).await.unwrap();
        store.delete("a.md", &replica).await.unwrap();
        assert!(store.find_all(&replica).await.unwrap().is_empty());

        // Deleting again is a no-op, not an error
        store.delete("a.md", &replica).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_missing_is_noop() {
        let store = InMemoryStore::new();
        let replica = ReplicaId::from(1);
        store.rename("ghost.md", "new.md", &replica).await.unwrap();
        assert!(store.find_all(&replica).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_rewrites_path() {
        let store = InMemoryStore::new();
        let replica = ReplicaId::from(1);

        store.upsert("old.md", "x", meta("x", 1), &replica).await.unwrap();
        let before = store.find_all(&replica).await.unwrap().remove(0);

        store.rename("old.md", "new.md", &replica).await.unwrap();

        let records = store.find_all(&replica).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "new.md");
        assert_eq!(records[0].content, "x");
        assert!(records[0].updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn test_feed_excludes_own_writes() {
        let store = InMemoryStore::new();
        let a = ReplicaId::from(1);
        let b = ReplicaId::from(2);

        let mut feed = store.subscribe(&a).await.unwrap();

        // A's own write never comes back to A
        store.upsert("mine.md", "x", meta("x", 1), &a).await.unwrap();
        // B's write does
        store.upsert("theirs.md", "y", meta("y", 2), &b).await.unwrap();

        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.path(), "theirs.md");
        assert_eq!(event.vault_id(), b.to_string());
        assert!(matches!(event, ChangeEvent::Insert { .. }));
    }

    #[tokio::test]
    async fn test_feed_delivers_update_and_delete() {
        let store = InMemoryStore::new();
        let a = ReplicaId::from(1);
        let b = ReplicaId::from(2);

        store.upsert("n.md", "v1", meta("v1", 1), &b).await.unwrap();

        let mut feed = store.subscribe(&a).await.unwrap();
        store.upsert("n.md", "v2", meta("v2", 2), &b).await.unwrap();
        store.delete("n.md", &b).await.unwrap();

        let update = feed.next().await.unwrap().unwrap();
        assert!(matches!(update, ChangeEvent::Update { .. }));
        assert_eq!(update.document().unwrap().content, "v2");

        let delete = feed.next().await.unwrap().unwrap();
        assert_eq!(
            delete,
            ChangeEvent::Delete {
                path: "n.md".into(),
                vault_id: b.to_string()
            }
        );
        assert!(delete.document().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let store = InMemoryStore::new();
        let replica = ReplicaId::from(1);
        store.upsert("a.md", "x", meta("x", 1), &replica).await.unwrap();
        store.upsert("b.md", "y", meta("y", 2), &replica).await.unwrap();

        let other = InMemoryStore::new();
        other.restore(store.snapshot());
        assert_eq!(other.find_all(&replica).await.unwrap().len(), 2);
    }
}
