//! Checkpoint Storage
//!
//! Where paused runs live between pause and resume. The in-memory store
//! serves a single process; the file store survives restarts and lets a
//! different process resume the run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::record::{validate_execution_id, Checkpoint};
use crate::error::CheckpointError;

/// Durable key/value storage for checkpoints, keyed by execution id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Writes a checkpoint, replacing any previous one for the same id.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, execution_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Removes and returns a checkpoint.
    async fn take(&self, execution_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Returns whether a checkpoint existed.
    async fn delete(&self, execution_id: &str) -> Result<bool, CheckpointError>;

    /// Ids of every stored checkpoint, sorted.
    async fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        validate_execution_id(&checkpoint.execution_id)?;
        self.data
            .write()
            .await
            .insert(checkpoint.execution_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.data.read().await.get(execution_id).cloned())
    }

    async fn take(&self, execution_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.data.write().await.remove(execution_id))
    }

    async fn delete(&self, execution_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.data.write().await.remove(execution_id).is_some())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.data.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";
const CLAIMED_SUFFIX: &str = ".claimed";

/// One JSON file per execution: `<dir>/<execution_id>.checkpoint.json`.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates the store, creating `dir` if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            CheckpointError::Storage(format!("cannot create '{}': {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, execution_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_execution_id(execution_id)?;
        Ok(self.dir.join(format!("{}{}", execution_id, CHECKPOINT_SUFFIX)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.execution_id)?;
        let content = checkpoint.to_json()?;

        // Write then rename so a crash never leaves a truncated checkpoint.
        let partial = path.with_extension("json.tmp");
        tokio::fs::write(&partial, content)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        debug!("Checkpoint written to {}", path.display());
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(execution_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::Storage(e.to_string())),
        };
        Checkpoint::from_json(&content).map(Some)
    }

    /// Claims the file with a rename before reading it, so among concurrent
    /// takers (in this process or another) exactly one gets the checkpoint.
    async fn take(&self, execution_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(execution_id)?;
        let claimed = self.dir.join(format!(
            "{}{}.{}{}",
            execution_id,
            CHECKPOINT_SUFFIX,
            Uuid::new_v4(),
            CLAIMED_SUFFIX
        ));

        match tokio::fs::rename(&path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::Storage(e.to_string())),
        }

        let parsed = match tokio::fs::read_to_string(&claimed).await {
            Ok(content) => Checkpoint::from_json(&content),
            Err(e) => Err(CheckpointError::Storage(e.to_string())),
        };
        let checkpoint = match parsed {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                // Hand the file back so the pause is not lost
                if let Err(e) = tokio::fs::rename(&claimed, &path).await {
                    warn!("Could not restore claimed checkpoint {}: {}", claimed.display(), e);
                }
                return Err(err);
            }
        };

        if let Err(e) = tokio::fs::remove_file(&claimed).await {
            warn!("Could not remove claimed checkpoint {}: {}", claimed.display(), e);
        }
        debug!("Checkpoint for '{}' claimed and removed", execution_id);
        Ok(Some(checkpoint))
    }

    async fn delete(&self, execution_id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(execution_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CheckpointError::Storage(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?
        {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(CHECKPOINT_SUFFIX)) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
