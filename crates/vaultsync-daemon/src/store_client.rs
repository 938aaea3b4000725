//! WebSocket client adapter for the remote store.
//!
//! Implements the core `RemoteStore` trait over the wire protocol: each
//! call sends a request frame and awaits the matching reply via a pending
//! map; unsolicited `Change` frames flow into the active subscription's
//! feed channel.

use crate::protocol::{HelloMessage, StoreReply, StoreRequest, MAX_FRAME_SIZE};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};
use vaultsync_core::store::Result as StoreResult;
use vaultsync_core::{ChangeEvent, ChangeFeed, DocumentMeta, DocumentRecord, RemoteStore, ReplicaId, StoreError};

type WriteHalf =
    futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<StoreReply>>>>;
type FeedSender = Arc<StdMutex<Option<mpsc::UnboundedSender<StoreResult<ChangeEvent>>>>>;

/// A connected store client, usable as the engine's `RemoteStore`.
pub struct RemoteStoreClient {
    address: String,
    write: Arc<Mutex<WriteHalf>>,
    pending: Pending,
    feed_tx: FeedSender,
    next_id: AtomicU64,
    read_task: Option<JoinHandle<()>>,
}

impl RemoteStoreClient {
    /// Connect to a store server and send the hello frame.
    pub async fn connect(
        address: &str,
        replica: &ReplicaId,
        database: &str,
        collection: &str,
    ) -> StoreResult<Self> {
        let (ws_stream, _) = connect_async(address)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let feed_tx: FeedSender = Arc::new(StdMutex::new(None));

        let hello = HelloMessage::new(&replica.to_string(), database, collection);
        {
            let mut w = write.lock().await;
            w.send(Message::Binary(hello.to_binary().into()))
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
        }

        let read_task = tokio::spawn(Self::read_loop(
            address.to_string(),
            read,
            Arc::clone(&pending),
            Arc::clone(&feed_tx),
        ));

        debug!("Connected to store at {}", address);
        Ok(Self {
            address: address.to_string(),
            write,
            pending,
            feed_tx,
            next_id: AtomicU64::new(1),
            read_task: Some(read_task),
        })
    }

    /// Read loop that routes replies to waiters and changes to the feed.
    async fn read_loop(
        address: String,
        mut read: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        pending: Pending,
        feed_tx: FeedSender,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", address);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            address,
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        continue;
                    }

                    Self::dispatch(&data, &pending, &feed_tx);
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection to {} closed", address);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", address, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection to {} stream ended", address);
                    break;
                }
            }
        }

        // Connection gone: wake every pending request and end the feed
        // with a final warning item.
        pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        if let Some(tx) = feed_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(Err(StoreError::Feed("store connection closed".into())));
        }
    }

    fn dispatch(data: &[u8], pending: &Pending, feed_tx: &FeedSender) {
        match bincode::deserialize::<StoreReply>(data) {
            Ok(StoreReply::Change { event }) => {
                if let Some(tx) = feed_tx
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                {
                    let _ = tx.send(Ok(event));
                }
            }
            Ok(reply) => {
                if let Some(id) = reply.id() {
                    let waiter = pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => debug!("Reply for unknown request id {}", id),
                    }
                }
            }
            Err(e) => warn!("Undecodable frame from store: {}", e),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and await its reply. `Failed` replies become
    /// `StoreError::Rejected`.
    async fn request(&self, request: StoreRequest) -> StoreResult<StoreReply> {
        let id = request.id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let frame = bincode::serialize(&request)
            .map_err(|e| StoreError::Connection(format!("encode: {e}")))?;

        let sent = {
            let mut write = self.write.lock().await;
            write.send(Message::Binary(frame.into())).await
        };
        if let Err(e) = sent {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(StoreError::Connection(e.to_string()));
        }

        match rx.await {
            Ok(StoreReply::Failed { message, .. }) => Err(StoreError::Rejected(message)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(StoreError::Connection(format!(
                "connection to {} closed",
                self.address
            ))),
        }
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for RemoteStoreClient {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

fn expect_ack(reply: StoreReply) -> StoreResult<()> {
    match reply {
        StoreReply::Ack { .. } => Ok(()),
        other => Err(StoreError::Rejected(format!("unexpected reply: {other:?}"))),
    }
}

#[async_trait]
impl RemoteStore for RemoteStoreClient {
    async fn upsert(
        &self,
        path: &str,
        content: &str,
        meta: DocumentMeta,
        replica: &ReplicaId,
    ) -> StoreResult<()> {
        let reply = self
            .request(StoreRequest::Upsert {
                id: self.next_id(),
                path: path.to_string(),
                content: content.to_string(),
                mtime: meta.mtime,
                size: meta.size,
                hash: meta.hash,
                vault_id: replica.to_string(),
            })
            .await?;
        expect_ack(reply)
    }

    async fn delete(&self, path: &str, replica: &ReplicaId) -> StoreResult<()> {
        let reply = self
            .request(StoreRequest::Delete {
                id: self.next_id(),
                path: path.to_string(),
                vault_id: replica.to_string(),
            })
            .await?;
        expect_ack(reply)
    }

    async fn rename(
        &self,
        old_path: &str,
        new_path: &str,
        replica: &ReplicaId,
    ) -> StoreResult<()> {
        let reply = self
            .request(StoreRequest::Rename {
                id: self.next_id(),
                old_path: old_path.to_string(),
                new_path: new_path.to_string(),
                vault_id: replica.to_string(),
            })
            .await?;
        expect_ack(reply)
    }

    async fn find_all(&self, replica: &ReplicaId) -> StoreResult<Vec<DocumentRecord>> {
        let reply = self
            .request(StoreRequest::FindAll {
                id: self.next_id(),
                vault_id: replica.to_string(),
            })
            .await?;
        match reply {
            StoreReply::Documents { documents, .. } => Ok(documents),
            other => Err(StoreError::Rejected(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn subscribe(&self, exclude: &ReplicaId) -> StoreResult<ChangeFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let reply = self
            .request(StoreRequest::Subscribe {
                id: self.next_id(),
                exclude_vault_id: exclude.to_string(),
            })
            .await?;
        expect_ack(reply)?;
        Ok(ChangeFeed::new(rx))
    }
}
