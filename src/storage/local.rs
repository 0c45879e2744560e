//! Local filesystem storage primitives.
//!
//! Every whole-file write goes through a temp file followed by a rename, so a
//! crash leaves either the old or the new content on disk, never a
//! truncated mix.

use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root_dir: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    ///
    /// Relative keys resolve against the root; absolute keys are used as-is.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Get the full path for a key.
    pub fn path(&self, key: impl AsRef<Path>) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    pub async fn write_bytes(&self, key: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Write JSON data.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        key: impl AsRef<Path>,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    pub async fn read_bytes(&self, key: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data.
    pub async fn read_json<T: DeserializeOwned>(&self, key: impl AsRef<Path>) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a file. Missing files are not an error.
    pub async fn remove(&self, key: impl AsRef<Path>) -> Result<bool> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}

/// Side channel for bodies that could not be parsed.
#[derive(Debug, Clone)]
pub struct DumpWriter {
    storage: LocalStorage,
}

impl DumpWriter {
    pub fn new(dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: LocalStorage::new(dump_dir),
        }
    }

    /// Persist an untouched raw body under `label`. Failures are logged,
    /// never propagated.
    pub async fn dump(&self, label: &str, body: &str) -> Option<PathBuf> {
        let key = format!("{label}.txt");
        match self.storage.write_bytes(&key, body.as_bytes()).await {
            Ok(()) => {
                let path = self.storage.path(&key);
                log::warn!("Raw body saved to {}", path.display());
                Some(path)
            }
            Err(e) => {
                log::error!("Could not save raw body {}: {}", key, e);
                None
            }
        }
    }
}
