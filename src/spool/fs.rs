//! Thin filesystem seam so tests can fake enumeration, metadata, and
//! failures without a real directory.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One directory entry as seen by the spool.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub len: u64,
    /// Filesystem creation time; `None` where the platform or filesystem
    /// does not record one.
    pub created_utc: Option<DateTime<Utc>>,
}

impl FileInfo {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }
}

pub trait FileSystem: Send + Sync + 'static {
    fn create_dir_all(&self, dir: &Path) -> impl Future<Output = io::Result<()>> + Send;

    /// Lists the plain files directly inside `dir`.
    fn list_files(&self, dir: &Path) -> impl Future<Output = io::Result<Vec<FileInfo>>> + Send;

    fn read(&self, path: &Path) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// Creates (or truncates) `path`, writes `bytes`, and flushes to disk.
    fn write(&self, path: &Path, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = io::Result<()>> + Send;

    fn remove(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;
}

/// The real thing, backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn create_dir_all(&self, dir: &Path) -> impl Future<Output = io::Result<()>> + Send {
        tokio::fs::create_dir_all(dir)
    }

    fn list_files(&self, dir: &Path) -> impl Future<Output = io::Result<Vec<FileInfo>>> + Send {
        async move {
            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                // Entries can vanish between enumeration and stat.
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                files.push(FileInfo {
                    path: entry.path(),
                    len: metadata.len(),
                    created_utc: metadata.created().ok().map(DateTime::<Utc>::from),
                });
            }
            Ok(files)
        }
    }

    fn read(&self, path: &Path) -> impl Future<Output = io::Result<Vec<u8>>> + Send {
        tokio::fs::read(path)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            let mut file = tokio::fs::File::create(path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            Ok(())
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = io::Result<()>> + Send {
        tokio::fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send {
        tokio::fs::remove_file(path)
    }
}
