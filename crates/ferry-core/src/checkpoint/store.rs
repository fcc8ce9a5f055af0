use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::{bail, Result, WrapErr};
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::CheckpointState;
use crate::errors::CheckpointNotFound;

/// Persistence capability for checkpoint records.
///
/// One writer per id is assumed; implementations must make `save` atomic so a
/// concurrent `load` never observes a partial record.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `state`, replacing any earlier record with the same id.
    async fn save(&self, state: &CheckpointState) -> Result<()>;

    /// Latest saved state. Fails with [`CheckpointNotFound`] for unknown ids.
    async fn load(&self, checkpoint_id: &str) -> Result<CheckpointState>;

    /// Every id currently stored.
    async fn list(&self) -> Result<Vec<String>>;

    /// Remove a record. Fails with [`CheckpointNotFound`] for unknown ids.
    async fn delete(&self, checkpoint_id: &str) -> Result<()>;

    async fn exists(&self, checkpoint_id: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|id| id == checkpoint_id))
    }
}

const RECORD_EXTENSION: &str = "json";
/// Suffix for records being written; never listed or loaded.
const PARTIAL_SUFFIX: &str = ".partial";

/// Ids become file names, so only a conservative character set is accepted.
pub fn validate_checkpoint_id(checkpoint_id: &str) -> Result<()> {
    if checkpoint_id.is_empty() || checkpoint_id.len() > 128 {
        bail!("invalid checkpoint id length: {:?}", checkpoint_id);
    }
    if !checkpoint_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid characters in checkpoint id: {:?}", checkpoint_id);
    }
    Ok(())
}

/// Stores each checkpoint as `<dir>/<id>.json`, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at [`crate::config::checkpoint_dir`].
    pub fn from_default_dir() -> Result<Self> {
        Ok(Self::new(crate::config::checkpoint_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, checkpoint_id: &str) -> PathBuf {
        self.dir.join(format!("{checkpoint_id}.{RECORD_EXTENSION}"))
    }

    fn partial_path(&self, checkpoint_id: &str) -> PathBuf {
        self.dir
            .join(format!("{checkpoint_id}.{RECORD_EXTENSION}{PARTIAL_SUFFIX}"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &CheckpointState) -> Result<()> {
        validate_checkpoint_id(&state.checkpoint_id)?;
        fs::create_dir_all(&self.dir).await.wrap_err_with(|| {
            format!("failed to create checkpoint directory {}", self.dir.display())
        })?;

        let payload = serde_json::to_vec_pretty(state)
            .wrap_err_with(|| format!("failed to serialise checkpoint {}", state.checkpoint_id))?;

        let temp = self.partial_path(&state.checkpoint_id);
        let final_path = self.record_path(&state.checkpoint_id);

        let write = async {
            let mut file = fs::File::create(&temp)
                .await
                .wrap_err_with(|| format!("failed to create {}", temp.display()))?;
            file.write_all(&payload)
                .await
                .wrap_err_with(|| format!("failed to write {}", temp.display()))?;
            file.sync_all()
                .await
                .wrap_err_with(|| format!("failed to sync {}", temp.display()))?;
            drop(file);

            // On Windows, rename fails if destination exists, so remove first
            #[cfg(windows)]
            {
                let _ = fs::remove_file(&final_path).await;
            }
            fs::rename(&temp, &final_path).await.wrap_err_with(|| {
                format!("renaming {} to {}", temp.display(), final_path.display())
            })?;
            #[cfg(unix)]
            sync_directory(&self.dir).await?;
            Ok::<(), eyre::Report>(())
        };

        if let Err(err) = write.await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        log::trace!(
            "checkpoint {} saved to {}",
            state.checkpoint_id,
            final_path.display()
        );
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<CheckpointState> {
        validate_checkpoint_id(checkpoint_id)?;
        let path = self.record_path(checkpoint_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CheckpointNotFound {
                    checkpoint_id: checkpoint_id.to_string(),
                }
                .into())
            }
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("failed to read checkpoint {}", path.display()))
            }
        };

        serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("failed to parse checkpoint {}", path.display()))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).wrap_err_with(|| {
                    format!("failed to read checkpoint directory {}", self.dir.display())
                })
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_checkpoint_id(stem).is_ok() {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        validate_checkpoint_id(checkpoint_id)?;
        let path = self.record_path(checkpoint_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            }
            .into()),
            Err(err) => {
                Err(err).wrap_err_with(|| format!("failed to delete checkpoint {}", path.display()))
            }
        }
    }

    async fn exists(&self, checkpoint_id: &str) -> Result<bool> {
        validate_checkpoint_id(checkpoint_id)?;
        Ok(fs::try_exists(self.record_path(checkpoint_id)).await?)
    }
}

/// Flush a directory so a completed rename survives power loss.
#[cfg(unix)]
async fn sync_directory(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir)
        .await
        .wrap_err_with(|| format!("failed to open {}", dir.display()))?;
    handle
        .sync_all()
        .await
        .wrap_err_with(|| format!("failed to sync {}", dir.display()))
}

/// Process-local store, used by tests and by callers that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<BTreeMap<String, CheckpointState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, state: &CheckpointState) -> Result<()> {
        validate_checkpoint_id(&state.checkpoint_id)?;
        self.records
            .lock()
            .insert(state.checkpoint_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<CheckpointState> {
        self.records
            .lock()
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| {
                CheckpointNotFound {
                    checkpoint_id: checkpoint_id.to_string(),
                }
                .into()
            })
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.records.lock().keys().cloned().collect())
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        match self.records.lock().remove(checkpoint_id) {
            Some(_) => Ok(()),
            None => Err(CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            }
            .into()),
        }
    }

    async fn exists(&self, checkpoint_id: &str) -> Result<bool> {
        Ok(self.records.lock().contains_key(checkpoint_id))
    }
}
