//! Externalized checkpoint storage.
//!
//! Epistemic foundation:
//! - K_i: Files are written to a temp path, synced, then renamed into place
//! - B_i: The directory may be empty or hold a torn temp file → Option, skipped
//! - B_i: A checkpoint file may fail to parse → fall back to the previous one

use super::Checkpoint;
use crate::models::CheckpointError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Durable home for checkpoints.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Persist a checkpoint. Must be atomic: a reader sees all of it or none.
    async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Most recent readable checkpoint.
    async fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Remove checkpoints older than `id`.
    async fn discard_before(&self, id: u64) -> Result<(), CheckpointError>;

    /// Remove all checkpoints.
    async fn clear(&self) -> Result<(), CheckpointError>;
}

/// One JSON file per checkpoint: `{dir}/chk-{id}.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store, creating the directory if needed.
    pub fn new(dir: &Path) -> Result<Self, CheckpointError> {
        fs::create_dir_all(dir).map_err(|e| CheckpointError::io("creating checkpoint dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("chk-{id:020}.json"))
    }

    /// Checkpoint files present, newest first.
    fn list(dir: &Path) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        let pattern = dir.join("chk-*.json");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern).map_err(|e| CheckpointError::Corrupt {
            path: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let mut found: Vec<(u64, PathBuf)> = paths
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let id = path
                    .file_stem()?
                    .to_str()?
                    .strip_prefix("chk-")?
                    .parse()
                    .ok()?;
                Some((id, path))
            })
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found)
    }

    fn write_blocking(dir: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let final_path = Self::path_for(dir, checkpoint.id);
        let temp_path = final_path.with_extension("json.tmp");

        let file = File::create(&temp_path)
            .map_err(|e| CheckpointError::io("creating temp checkpoint", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, checkpoint).map_err(|e| CheckpointError::Corrupt {
            path: temp_path.display().to_string(),
            reason: format!("serializing checkpoint: {e}"),
        })?;
        writer
            .flush()
            .map_err(|e| CheckpointError::io("flushing checkpoint", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| CheckpointError::io("syncing checkpoint", e))?;

        // Atomic rename
        fs::rename(&temp_path, &final_path)
            .map_err(|e| CheckpointError::io("renaming checkpoint", e))?;
        Ok(())
    }

    fn read_blocking(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let file = File::open(path).map_err(|e| CheckpointError::io("opening checkpoint", e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| CheckpointError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T, CheckpointError> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || f(dir))
            .await
            .map_err(|e| CheckpointError::Task(e.to_string()))?
    }
}

#[async_trait]
impl CheckpointStorage for FileCheckpointStore {
    async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let checkpoint = checkpoint.clone();
        self.blocking(move |dir| {
            Self::write_blocking(&dir, &checkpoint)?;
            debug!(id = checkpoint.id, "Checkpoint saved");
            Ok(())
        })
        .await
    }

    async fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        self.blocking(|dir| {
            for (id, path) in Self::list(&dir)? {
                match Self::read_blocking(&path) {
                    Ok(checkpoint) => return Ok(Some(checkpoint)),
                    Err(e) => warn!(id, error = %e, "Skipping unreadable checkpoint"),
                }
            }
            Ok(None)
        })
        .await
    }

    async fn discard_before(&self, id: u64) -> Result<(), CheckpointError> {
        self.blocking(move |dir| {
            for (old, path) in Self::list(&dir)? {
                if old < id {
                    fs::remove_file(&path)
                        .map_err(|e| CheckpointError::io("removing old checkpoint", e))?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        self.blocking(|dir| {
            for (_, path) in Self::list(&dir)? {
                fs::remove_file(&path)
                    .map_err(|e| CheckpointError::io("removing checkpoint", e))?;
            }
            Ok(())
        })
        .await
    }
}

/// In-process storage; checkpoints do not survive the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<u64, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Checkpoint>> {
        // A poisoned map is still consistent: every mutation is a single call
        self.checkpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStorage for MemoryCheckpointStore {
    async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.lock().insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.lock().values().next_back().cloned())
    }

    async fn discard_before(&self, id: u64) -> Result<(), CheckpointError> {
        self.lock().retain(|&existing, _| existing >= id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        self.lock().clear();
        Ok(())
    }
}
