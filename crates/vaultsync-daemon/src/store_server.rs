//! WebSocket store server.
//!
//! Serves the document-store contract to connecting replicas: a namespaced
//! `InMemoryStore` per `(database, collection)`, CRUD request handling, and
//! change-feed forwarding. With `--data-dir` set, each namespace is
//! snapshotted to JSON after every mutation and restored on first use, so
//! the store survives restarts.

use crate::protocol::{HelloMessage, StoreReply, StoreRequest, MAX_FRAME_SIZE};
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use vaultsync_core::{DocumentMeta, DocumentRecord, InMemoryStore, RemoteStore, ReplicaId};

type Namespaces = Arc<StdMutex<HashMap<String, Arc<InMemoryStore>>>>;
type WriteHalf = Arc<Mutex<futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>>>;

/// The store server: shared namespace table plus snapshot location.
pub struct StoreServer {
    namespaces: Namespaces,
    data_dir: Option<PathBuf>,
}

impl StoreServer {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            namespaces: Arc::new(StdMutex::new(HashMap::new())),
            data_dir,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Store server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Handle a new incoming TCP connection.
    ///
    /// Upgrades to WebSocket and spawns a self-contained connection task;
    /// subscriptions are forwarded through the store's own feed channels,
    /// so connections need no cross-routing.
    pub async fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and immediately close without
                // completing the WebSocket handshake. Log these as debug.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let namespaces = Arc::clone(&self.namespaces);
        let data_dir = self.data_dir.clone();
        tokio::spawn(async move {
            handle_connection(ws_stream, addr, namespaces, data_dir).await;
        });
    }
}

/// Resolve (and lazily restore) the store for a namespace.
fn namespace_store(namespaces: &Namespaces, ns: &str, data_dir: Option<&Path>) -> Arc<InMemoryStore> {
    let mut map = namespaces.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(store) = map.get(ns) {
        return Arc::clone(store);
    }

    let store = Arc::new(InMemoryStore::new());
    if let Some(dir) = data_dir {
        let path = snapshot_path(dir, ns);
        if path.exists() {
            match load_snapshot(&path) {
                Ok(records) => {
                    info!("Restored {} record(s) for namespace {}", records.len(), ns);
                    store.restore(records);
                }
                Err(e) => warn!("Failed to restore snapshot for {}: {}", ns, e),
            }
        }
    }
    map.insert(ns.to_string(), Arc::clone(&store));
    store
}

fn snapshot_path(dir: &Path, ns: &str) -> PathBuf {
    dir.join(format!("{}.json", ns.replace('/', "_")))
}

fn load_snapshot(path: &Path) -> Result<Vec<DocumentRecord>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn persist_namespace(store: &InMemoryStore, ns: &str, data_dir: Option<&Path>) {
    let Some(dir) = data_dir else { return };
    let result: Result<()> = (|| {
        std::fs::create_dir_all(dir)?;
        let contents = serde_json::to_string_pretty(&store.snapshot())?;
        std::fs::write(snapshot_path(dir, ns), contents)?;
        Ok(())
    })();
    if let Err(e) = result {
        warn!("Failed to persist namespace {}: {}", ns, e);
    }
}

/// One connected client, from hello to close.
async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    namespaces: Namespaces,
    data_dir: Option<PathBuf>,
) {
    let (write, mut read) = ws_stream.split();
    let write: WriteHalf = Arc::new(Mutex::new(write));

    // The first frame must be the JSON hello.
    let hello = loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.into_bytes(),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        debug!("Connection from {} closed before hello", addr);
                        return;
                    }
                };
                match HelloMessage::from_binary(&data) {
                    Some(hello) => break hello,
                    None => {
                        warn!("First frame from {} was not a hello, closing", addr);
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                debug!("Connection from {} failed before hello: {}", addr, e);
                return;
            }
            None => return,
        }
    };

    let ns = hello.namespace();
    let store = namespace_store(&namespaces, &ns, data_dir.as_deref());
    info!("Replica {} ({}) joined namespace {}", hello.vault_id, addr, ns);

    let mut feed_task: Option<JoinHandle<()>> = None;

    while let Some(msg) = read.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!("Received close frame from {}", addr);
                break;
            }
            Err(e) => {
                debug!("Connection from {} errored: {}", addr, e);
                break;
            }
        };

        if data.len() > MAX_FRAME_SIZE {
            warn!(
                "Frame from {} exceeds max size ({} > {}), dropping",
                addr,
                data.len(),
                MAX_FRAME_SIZE
            );
            continue;
        }

        let request: StoreRequest = match bincode::deserialize(&data) {
            Ok(request) => request,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", addr, e);
                continue;
            }
        };

        let (reply, mutated) = handle_request(request, &store, &write, &mut feed_task).await;
        if mutated {
            persist_namespace(&store, &ns, data_dir.as_deref());
        }

        let frame = match bincode::serialize(&reply) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode reply for {}: {}", addr, e);
                continue;
            }
        };
        let mut w = write.lock().await;
        if w.send(Message::Binary(frame.into())).await.is_err() {
            break;
        }
    }

    if let Some(task) = feed_task.take() {
        task.abort();
    }
    info!("Replica {} ({}) left namespace {}", hello.vault_id, addr, ns);
}

fn parse_replica(vault_id: &str) -> std::result::Result<ReplicaId, String> {
    vault_id
        .parse()
        .map_err(|e| format!("bad vault_id `{vault_id}`: {e}"))
}

/// Dispatch one request against the namespace store. Returns the reply and
/// whether the store was mutated.
async fn handle_request(
    request: StoreRequest,
    store: &Arc<InMemoryStore>,
    write: &WriteHalf,
    feed_task: &mut Option<JoinHandle<()>>,
) -> (StoreReply, bool) {
    match request {
        StoreRequest::Upsert {
            id,
            path,
            content,
            mtime,
            size,
            hash,
            vault_id,
        } => {
            let replica = match parse_replica(&vault_id) {
                Ok(replica) => replica,
                Err(message) => return (StoreReply::Failed { id, message }, false),
            };
            let meta = DocumentMeta { mtime, size, hash };
            match store.upsert(&path, &content, meta, &replica).await {
                Ok(()) => (StoreReply::Ack { id }, true),
                Err(e) => (
                    StoreReply::Failed {
                        id,
                        message: e.to_string(),
                    },
                    false,
                ),
            }
        }

        StoreRequest::Delete { id, path, vault_id } => {
            let replica = match parse_replica(&vault_id) {
                Ok(replica) => replica,
                Err(message) => return (StoreReply::Failed { id, message }, false),
            };
            match store.delete(&path, &replica).await {
                Ok(()) => (StoreReply::Ack { id }, true),
                Err(e) => (
                    StoreReply::Failed {
                        id,
                        message: e.to_string(),
                    },
                    false,
                ),
            }
        }

        StoreRequest::Rename {
            id,
            old_path,
            new_path,
            vault_id,
        } => {
            let replica = match parse_replica(&vault_id) {
                Ok(replica) => replica,
                Err(message) => return (StoreReply::Failed { id, message }, false),
            };
            match store.rename(&old_path, &new_path, &replica).await {
                Ok(()) => (StoreReply::Ack { id }, true),
                Err(e) => (
                    StoreReply::Failed {
                        id,
                        message: e.to_string(),
                    },
                    false,
                ),
            }
        }

        StoreRequest::FindAll { id, vault_id } => {
            let replica = match parse_replica(&vault_id) {
                Ok(replica) => replica,
                Err(message) => return (StoreReply::Failed { id, message }, false),
            };
            match store.find_all(&replica).await {
                Ok(documents) => (StoreReply::Documents { id, documents }, false),
                Err(e) => (
                    StoreReply::Failed {
                        id,
                        message: e.to_string(),
                    },
                    false,
                ),
            }
        }

        StoreRequest::Subscribe {
            id,
            exclude_vault_id,
        } => {
            let replica = match parse_replica(&exclude_vault_id) {
                Ok(replica) => replica,
                Err(message) => return (StoreReply::Failed { id, message }, false),
            };
            match store.subscribe(&replica).await {
                Ok(mut feed) => {
                    // One active subscription per connection.
                    if let Some(task) = feed_task.take() {
                        task.abort();
                    }
                    let write = Arc::clone(write);
                    *feed_task = Some(tokio::spawn(async move {
                        while let Some(item) = feed.next().await {
                            let Ok(event) = item else { continue };
                            let frame = match bincode::serialize(&StoreReply::Change { event }) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!("Failed to encode change frame: {}", e);
                                    continue;
                                }
                            };
                            let mut w = write.lock().await;
                            if w.send(Message::Binary(frame.into())).await.is_err() {
                                break;
                            }
                        }
                    }));
                    (StoreReply::Ack { id }, false)
                }
                Err(e) => (
                    StoreReply::Failed {
                        id,
                        message: e.to_string(),
                    },
                    false,
                ),
            }
        }
    }
}
