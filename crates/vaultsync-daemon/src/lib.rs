//! vaultsync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod native_fs;
pub mod persistence;
pub mod protocol;
pub mod store_client;
pub mod store_server;
pub mod watcher;

// Re-export key types for convenience
pub use native_fs::NativeFs;
pub use persistence::{LocalState, StateStorage, STATE_DIR};
pub use protocol::{HelloMessage, StoreReply, StoreRequest, MAX_FRAME_SIZE};
pub use store_client::RemoteStoreClient;
pub use store_server::StoreServer;
pub use watcher::{FileEvent, FileEventKind, VaultWatcher};
