/// Progress Store
///
/// Durable record of the last committed block per protocol. Written only after a
/// cycle's snapshot is appended, read at the start of every cycle.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{HarvestError, Result};
use crate::models::ProgressCursor;

/// Single writer per protocol. Writes replace the whole cursor.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Returns an absent cursor when the protocol has never committed a cycle.
    async fn read(&self, protocol: &str) -> Result<ProgressCursor>;

    async fn write(&self, cursor: &ProgressCursor) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorDocument {
    protocol: String,
    last_block_number: Option<u64>,
    updated_at: DateTime<Utc>,
}

/// One JSON document per protocol, replaced by rename
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, protocol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", protocol))
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn read(&self, protocol: &str) -> Result<ProgressCursor> {
        let path = self.path_for(protocol);

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ProgressCursor::absent(protocol)),
            Err(e) => return Err(HarvestError::Progress(format!("failed to read {}: {}", path.display(), e))),
        };

        let doc: CursorDocument = serde_json::from_slice(&raw)
            .map_err(|e| HarvestError::Progress(format!("corrupt cursor file {}: {}", path.display(), e)))?;

        if doc.protocol != protocol {
            return Err(HarvestError::Progress(format!(
                "cursor file {} belongs to '{}', not '{}'",
                path.display(),
                doc.protocol,
                protocol
            )));
        }

        Ok(ProgressCursor { protocol: doc.protocol, last_block_number: doc.last_block_number })
    }

    async fn write(&self, cursor: &ProgressCursor) -> Result<()> {
        let io_err = |e: std::io::Error| HarvestError::Progress(format!("failed to persist cursor: {}", e));

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let doc = CursorDocument {
            protocol: cursor.protocol.clone(),
            last_block_number: cursor.last_block_number,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&doc).map_err(|e| HarvestError::Progress(e.to_string()))?;

        let target = self.path_for(&cursor.protocol);
        let tmp = self.dir.join(format!(".{}.json.tmp", cursor.protocol));

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(&body).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        tokio::fs::rename(&tmp, &target).await.map_err(io_err)?;

        tracing::debug!("Cursor for {} written to {}", cursor.protocol, target.display());
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store that also counts writes
    #[derive(Debug, Default)]
    pub struct MemoryProgressStore {
        cursors: Mutex<HashMap<String, Option<u64>>>,
        writes: Mutex<usize>,
    }

    impl MemoryProgressStore {
        pub fn with_cursor(cursor: ProgressCursor) -> Self {
            let store = Self::default();
            store.cursors.lock().unwrap().insert(cursor.protocol, cursor.last_block_number);
            store
        }

        pub fn last_block(&self, protocol: &str) -> Option<u64> {
            self.cursors.lock().unwrap().get(protocol).copied().flatten()
        }

        pub fn write_count(&self) -> usize {
            *self.writes.lock().unwrap()
        }
    }

    #[async_trait]
    impl ProgressStore for MemoryProgressStore {
        async fn read(&self, protocol: &str) -> Result<ProgressCursor> {
            let last = self.cursors.lock().unwrap().get(protocol).copied().flatten();
            Ok(ProgressCursor { protocol: protocol.to_string(), last_block_number: last })
        }

        async fn write(&self, cursor: &ProgressCursor) -> Result<()> {
            self.cursors.lock().unwrap().insert(cursor.protocol.clone(), cursor.last_block_number);
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }
    }
}
