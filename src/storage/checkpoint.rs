//! Checkpoint persistence.

use std::path::PathBuf;

use chrono::Utc;

use crate::error::Result;
use crate::models::Checkpoint;
use crate::storage::LocalStorage;

/// Reads and atomically overwrites the checkpoint file of one target.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    storage: LocalStorage,
    key: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (root, key) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), PathBuf::from(name)),
            _ => (PathBuf::new(), path),
        };
        Self {
            storage: LocalStorage::new(root),
            key,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.storage.path(&self.key)
    }

    /// Load the checkpoint, `None` when the target has never been harvested.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        self.storage.read_json(&self.key).await
    }

    /// Stamp and persist. The previous file stays intact until the rename.
    pub async fn save(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.timestamp = Utc::now();
        self.storage.write_json(&self.key, checkpoint).await
    }

    /// Explicit reset. Returns whether a checkpoint existed.
    pub async fn reset(&self) -> Result<bool> {
        let removed = self.storage.remove(&self.key).await?;
        if removed {
            log::info!("Checkpoint {} removed", self.path().display());
        }
        Ok(removed)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path().join("checkpoint.json"));
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.exists());
    }

    #[tokio::test]
    async fn test_save_load_reset() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path().join("state/checkpoint.json"));

        let mut cp = Checkpoint {
            cursor: Some("X2".into()),
            ..Checkpoint::default()
        };
        cp.dedup_keys.insert("a".into());
        store.save(&mut cp).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.cursor.as_deref(), Some("X2"));
        assert!(loaded.dedup_keys.contains("a"));

        assert!(store.reset().await.unwrap());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoint.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = CheckpointStore::new(&path);
        assert!(store.load().await.is_err());
    }
}
