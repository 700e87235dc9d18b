//! File system operations abstraction for testing.
//!
//! Mirrors the `CommandExecutor` seam: a trait so `WorktreeManager` can be
//! exercised against `MockFileSystemOperations` without touching disk.

use anyhow::Result;
use std::path::Path;
use std::time::SystemTime;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait::async_trait]
pub trait FileSystemOperations: Send + Sync {
    async fn create_dir_all(&self, path: &str) -> Result<()>;

    async fn write(&self, path: &str, contents: &[u8]) -> Result<()>;

    fn exists(&self, path: &str) -> bool;

    async fn remove_dir_all(&self, path: &str) -> Result<()>;

    async fn symlink(&self, original: &str, link: &str) -> Result<()>;

    /// Lists immediate child directory names under `path` with their last-modified
    /// time, for the orphan-worktree sweep (§4.7 `cleanupOrphaned`).
    async fn read_dir_entries(&self, path: &str) -> Result<Vec<(String, SystemTime)>>;
}

/// Production implementation backed by `tokio::fs`.
pub struct StandardFileSystem;

#[async_trait::async_trait]
impl FileSystemOperations for StandardFileSystem {
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await.map_err(Into::into)
    }

    async fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        tokio::fs::write(path, contents).await.map_err(Into::into)
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        tokio::fs::remove_dir_all(path).await.map_err(Into::into)
    }

    async fn symlink(&self, original: &str, link: &str) -> Result<()> {
        let original = original.to_string();
        let link = link.to_string();
        tokio::task::spawn_blocking(move || {
            #[cfg(unix)]
            std::os::unix::fs::symlink(&original, &link)?;
            #[cfg(not(unix))]
            std::os::windows::fs::symlink_file(&original, &link)?;
            Ok::<(), std::io::Error>(())
        })
        .await??;
        Ok(())
    }

    async fn read_dir_entries(&self, path: &str) -> Result<Vec<(String, SystemTime)>> {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(path).await?;
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((entry.file_name().to_string_lossy().to_string(), modified));
        }
        Ok(entries)
    }
}
