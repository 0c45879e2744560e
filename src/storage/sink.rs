// src/storage/sink.rs

//! Dedup index and append-only record log.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{AppError, Result};
use crate::models::Record;

/// Resource ids already written to the log.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    keys: HashSet<String>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns `true` when the key was not present before.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, keys: I) {
        self.keys.extend(keys);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sorted copy for the checkpoint.
    pub fn to_sorted(&self) -> BTreeSet<String> {
        self.keys.iter().cloned().collect()
    }
}

/// Only the identity is needed when reading the log back.
#[derive(Deserialize)]
struct LoggedKey {
    resource_id: String,
}

/// Append-only, newline-delimited JSON log of accepted records.
#[derive(Debug)]
pub struct RecordSink {
    path: PathBuf,
    /// The file ends mid-line (a torn append from an earlier crash)
    needs_newline: bool,
}

impl RecordSink {
    /// Open the log at `path`, creating parent directories.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let needs_newline = ends_mid_line(&path).await?;
        if needs_newline {
            log::warn!(
                "{} ends with a partial line; next append starts on a new line",
                path.display()
            );
        }
        Ok(Self {
            path,
            needs_newline,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resource ids present in the log. Unparseable lines are skipped.
    pub async fn logged_keys(&self) -> Result<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut keys = Vec::new();
        let mut skipped = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LoggedKey>(line) {
                Ok(entry) => keys.push(entry.resource_id),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!(
                "Skipped {} unreadable line(s) in {}",
                skipped,
                self.path.display()
            );
        }
        Ok(keys)
    }

    /// Seed `index` from the log so memory matches disk before any write.
    pub async fn seed_index(&self, index: &mut DedupIndex) -> Result<usize> {
        let keys = self.logged_keys().await?;
        let before = index.len();
        index.extend(keys);
        Ok(index.len() - before)
    }

    /// Append every record whose resource id is not yet in `index`.
    ///
    /// Records are written in order, one line each, flushed before
    /// returning. Returns the accepted records.
    pub async fn accept(&mut self, index: &mut DedupIndex, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut accepted = Vec::new();
        let mut buffer = Vec::new();
        if self.needs_newline {
            buffer.push(b'\n');
        }

        let mut batch = HashSet::new();
        for record in records {
            if index.contains(&record.resource_id) || !batch.insert(record.resource_id.clone()) {
                continue;
            }
            serde_json::to_writer(&mut buffer, &record)?;
            buffer.push(b'\n');
            accepted.push(record);
        }

        if accepted.is_empty() {
            return Ok(accepted);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        file.sync_data().await?;
        self.needs_newline = false;

        index.extend(batch);

        Ok(accepted)
    }
}

async fn ends_mid_line(path: &Path) -> Result<bool> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(AppError::Io(e)),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(std::io::SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}
