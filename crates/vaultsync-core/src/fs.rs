//! FileSystem trait abstraction for host-independent vault access.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in vaultsync-daemon) - Uses tokio::fs
//!
//! Paths are relative to the vault root and `/`-separated regardless of
//! platform.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Host-independent filesystem abstraction.
///
/// Implementations must be `Send + Sync`: the engine's entry points (file
/// events, the change-feed task, the scheduler) interleave freely.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents, replacing any existing file
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents ("" is the vault root)
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create a directory. Creating an existing directory reports
    /// `AlreadyExists`; callers treat that as success.
    async fn mkdir(&self, path: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Node {
    File { content: Vec<u8>, mtime: u64 },
    Dir,
}

/// In-memory filesystem for testing.
pub struct InMemoryFs {
    nodes: RwLock<HashMap<String, Node>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Set a specific mtime for testing "latest wins" scenarios.
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = normalize(path);
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(Node::File { mtime: m, .. }) = nodes.get_mut(&path) {
            *m = mtime;
        }
    }

    fn now_millis() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&path) {
            Some(Node::File { content, .. }) => Ok(content.clone()),
            Some(Node::Dir) => Err(FsError::IsDirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if matches!(nodes.get(&path), Some(Node::Dir)) {
            return Err(FsError::IsDirectory(path));
        }
        // Implicitly materialize ancestors, as a real fs adapter would have
        // them created beforehand.
        for ancestor in crate::paths::ancestors(&path) {
            nodes.entry(ancestor).or_insert(Node::Dir);
        }
        nodes.insert(
            path,
            Node::File {
                content: content.to_vec(),
                mtime: Self::now_millis(),
            },
        );
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize(path);
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        if !path.is_empty() {
            match nodes.get(&path) {
                Some(Node::Dir) => {}
                Some(Node::File { .. }) => return Err(FsError::Io(format!("not a directory: {path}"))),
                None => return Err(FsError::NotFound(path)),
            }
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };

        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (node_path, node) in nodes.iter() {
            let Some(rest) = node_path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let name = rest.split('/').next().unwrap_or(rest);
            let direct = !rest.contains('/');
            if seen.insert(name.to_string()) {
                entries.push(FileEntry {
                    name: name.to_string(),
                    // A deeper path implies `name` is a directory level
                    is_dir: !direct || matches!(node, Node::Dir),
                });
            } else if !direct {
                // Already recorded as a file, but deeper entries prove a dir
                if let Some(entry) = entries.iter_mut().find(|e| e.name == name) {
                    entry.is_dir = true;
                }
            }
        }
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        match nodes.remove(&path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(true);
        }
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.contains_key(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = normalize(path);
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&path) {
            Some(Node::File { content, mtime }) => Ok(FileStat {
                mtime_millis: *mtime,
                size: content.len() as u64,
                is_dir: false,
            }),
            Some(Node::Dir) => Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            }),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(());
        }
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&path) {
            Some(Node::Dir) => Err(FsError::AlreadyExists(path)),
            Some(Node::File { .. }) => Err(FsError::Io(format!("file in the way: {path}"))),
            None => {
                for ancestor in crate::paths::ancestors(&path) {
                    nodes.entry(ancestor).or_insert(Node::Dir);
                }
                nodes.insert(path, Node::Dir);
                Ok(())
            }
        }
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem.
// This allows sharing a filesystem between the engine and test assertions.
#[async_trait]
impl<T: FileSystem + Send + Sync> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.txt", b"hello world").await.unwrap();

        let content = fs.read("test.txt").await.unwrap();
        assert_eq!(content, b"hello world");

        assert!(fs.exists("test.txt").await.unwrap());
        assert!(!fs.exists("nonexistent.txt").await.unwrap());

        fs.delete("test.txt").await.unwrap();
        assert!(!fs.exists("test.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        fs.write("a/b/c.txt", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.txt");
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_mkdir_already_exists() {
        let fs = InMemoryFs::new();
        fs.mkdir("a").await.unwrap();
        assert!(matches!(
            fs.mkdir("a").await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_set_mtime() {
        let fs = InMemoryFs::new();
        fs.write("a.md", b"x").await.unwrap();
        fs.set_mtime("a.md", 42);
        assert_eq!(fs.stat("a.md").await.unwrap().mtime_millis, 42);
    }

    #[tokio::test]
    async fn test_list_root() {
        let fs = InMemoryFs::new();
        fs.write("top.md", b"x").await.unwrap();
        fs.write("dir/nested.md", b"y").await.unwrap();

        let mut entries = fs.list("").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "dir");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].name, "top.md");
        assert!(!entries[1].is_dir);
    }
}
