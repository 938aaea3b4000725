//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use vaultsync_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};

/// Vault filesystem rooted at a directory on disk.
///
/// Vault paths are relative and `/`-separated; they are joined onto the
/// root for every operation.
pub struct NativeFs {
    root: PathBuf,
}

impl NativeFs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

fn map_io(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(format!("{path}: {e}")),
    }
}

fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        fs::write(self.full_path(path), content)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let mut dir = fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(path, e))? {
            let metadata = entry.metadata().await.map_err(|e| map_io(path, e))?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
            });
        }
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        let metadata = fs::metadata(&full).await.map_err(|e| map_io(path, e))?;
        if metadata.is_dir() {
            fs::remove_dir(&full).await.map_err(|e| map_io(path, e))
        } else {
            fs::remove_file(&full).await.map_err(|e| map_io(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(FileStat {
            mtime_millis: mtime_millis(&metadata),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }
}
