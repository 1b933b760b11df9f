//! Key/blob storage behind checkpoints.

use crate::errors::CheckpointError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Storage contract for checkpoint blobs. `put` must be atomic: a concurrent
/// `get` sees either the old blob or the new one, never a partial write.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CheckpointError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError>;

    /// All keys in ascending order.
    async fn list_keys(&self) -> Result<Vec<String>, CheckpointError>;
}

const EXTENSION: &str = "ckpt";

/// One file per checkpoint in a directory. Writes go to `<key>.ckpt.tmp`
/// and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CheckpointError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(CheckpointError::Io {
                key: key.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "checkpoint keys must be plain file names",
                ),
            });
        }
        Ok(self.dir.join(format!("{key}.{EXTENSION}")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CheckpointError> {
        let path = self.path_for(key)?;
        let io_err = |source: std::io::Error| CheckpointError::Io {
            key: key.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let temp_path = path.with_extension(format!("{EXTENSION}.tmp"));
        tokio::fs::write(&temp_path, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&temp_path, &path).await.map_err(io_err)?;

        tracing::debug!(key, path = %path.display(), "Checkpoint written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CheckpointError::NotFound {
                key: key.to_string(),
            }),
            Err(source) => Err(CheckpointError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    key: self.dir.display().to_string(),
                    source,
                });
            }
        };

        let mut keys = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| CheckpointError::Io {
                key: self.dir.display().to_string(),
                source,
            })?;
            let Some(entry) = entry else { break };

            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// In-process store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CheckpointError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list_keys(&self) -> Result<Vec<String>, CheckpointError> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}
