//! Local file-system collaborator: the synchronized folder on this device.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;

/// Bytes and metadata of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub data: Vec<u8>,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: u64,
}

/// Read/overwrite access to files relative to a sync root.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<Option<LocalFile>>;
    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()>;
    /// Returns whether a file was removed.
    async fn remove_file(&self, path: &Path) -> Result<bool>;
}

/// Directory-backed file store.
#[derive(Clone, Debug)]
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).context("Failed to create sync root")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.components().any(|c| !matches!(c, Component::Normal(_))) {
            anyhow::bail!("Path {} escapes the sync root", path.display());
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl FileStore for LocalFiles {
    async fn read_file(&self, path: &Path) -> Result<Option<LocalFile>> {
        let full = self.resolve(path)?;
        if !full.exists() {
            return Ok(None);
        }

        let data = fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))?;
        let meta = fs::metadata(&full).await?;
        let modified_ms = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        tracing::debug!("Read {} ({} bytes)", path.display(), data.len());
        Ok(Some(LocalFile {
            size: data.len() as u64,
            data,
            modified_ms,
        }))
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create parent directory")?;
        }

        // Write next to the target and rename so readers never see a torn file.
        let mut tmp = full.clone().into_os_string();
        tmp.push(".hivesync-tmp");
        fs::write(&tmp, data)
            .await
            .with_context(|| format!("Failed to write {}", full.display()))?;
        fs::rename(&tmp, &full).await?;

        tracing::debug!("Wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<bool> {
        let full = self.resolve(path)?;
        if !full.exists() {
            return Ok(false);
        }
        fs::remove_file(&full)
            .await
            .with_context(|| format!("Failed to remove {}", full.display()))?;
        tracing::debug!("Removed {}", path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_files_roundtrip() -> Result<()> {
        let temp = TempDir::new()?;
        let files = LocalFiles::new(temp.path().to_path_buf())?;

        let path = Path::new("docs/notes.txt");
        files.write_file(path, b"hello").await?;

        let read = files.read_file(path).await?.expect("file present");
        assert_eq!(read.data, b"hello");
        assert_eq!(read.size, 5);
        assert!(read.modified_ms > 0);

        assert_eq!(files.read_file(Path::new("missing.txt")).await?, None);

        assert!(files.remove_file(path).await?);
        assert!(!files.remove_file(path).await?);
        assert_eq!(files.read_file(path).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() -> Result<()> {
        let temp = TempDir::new()?;
        let files = LocalFiles::new(temp.path().join("root"))?;

        assert!(files.write_file(Path::new("../outside"), b"x").await.is_err());
        assert!(files.read_file(Path::new("/etc/passwd")).await.is_err());
        Ok(())
    }
}
