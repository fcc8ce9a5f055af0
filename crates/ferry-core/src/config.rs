use directories::{BaseDirs, ProjectDirs};
use eyre::{eyre, Result, WrapErr};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::checkpoint::TransferOptions;

const CHECKPOINT_DIR_ENV: &str = "FERRY_CHECKPOINT_DIR";

static CHECKPOINT_DIR_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

/// Override the checkpoint directory for the current process.
/// Subsequent calls replace the previous override.
pub fn set_checkpoint_dir<P: AsRef<Path>>(path: P) {
    *CHECKPOINT_DIR_OVERRIDE.write() = Some(path.as_ref().to_path_buf());
}

/// Clear any previously configured override.
pub fn clear_checkpoint_dir_override() {
    CHECKPOINT_DIR_OVERRIDE.write().take();
}

/// Return the current override path, if one has been set.
pub fn checkpoint_dir_override() -> Option<PathBuf> {
    CHECKPOINT_DIR_OVERRIDE.read().clone()
}

/// Resolve the checkpoint directory.
/// Priority: explicit override -> $FERRY_CHECKPOINT_DIR -> platform data dir -> ~/.local/share/ferry
pub fn checkpoint_dir() -> Result<PathBuf> {
    if let Some(path) = CHECKPOINT_DIR_OVERRIDE.read().clone() {
        return Ok(path);
    }

    if let Some(path) = env::var_os(CHECKPOINT_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    if let Some(proj) = ProjectDirs::from("com", "Ferry", "Ferry") {
        return Ok(proj.data_dir().join("checkpoints"));
    }

    if let Some(base) = BaseDirs::new() {
        return Ok(base
            .home_dir()
            .join(".local")
            .join("share")
            .join("ferry")
            .join("checkpoints"));
    }

    Err(eyre!(
        "unable to determine checkpoint directory for ferry (no override and no platform default)"
    ))
}

/// Engine configuration loaded from a TOML file.
///
/// ```toml
/// checkpoint_dir = "/var/lib/ferry/checkpoints"
///
/// [transfer]
/// batch_size = 500
/// max_retries = 3
/// sync_policy = 2
/// ```
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    /// Where checkpoint records are written; falls back to [`checkpoint_dir`].
    pub checkpoint_dir: Option<PathBuf>,
    /// Defaults applied to every new transfer.
    #[serde(default)]
    pub transfer: TransferOptions,
}

impl EngineConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .wrap_err_with(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.transfer.validate()?;
        Ok(config)
    }

    /// The configured checkpoint directory, or the process-wide default.
    pub fn resolved_checkpoint_dir(&self) -> Result<PathBuf> {
        match &self.checkpoint_dir {
            Some(dir) => Ok(dir.clone()),
            None => checkpoint_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SyncPolicy;

    #[test]
    fn override_wins() {
        set_checkpoint_dir("/tmp/ferry-override");
        assert_eq!(checkpoint_dir().unwrap(), PathBuf::from("/tmp/ferry-override"));
        clear_checkpoint_dir_override();
        assert!(checkpoint_dir_override().is_none());
    }

    #[test]
    fn parses_partial_transfer_table() {
        let config = EngineConfig::parse(
            r#"
            checkpoint_dir = "/data/ckpt"

            [transfer]
            batch_size = 50
            sync_policy = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/data/ckpt")));
        assert_eq!(config.transfer.batch_size, 50);
        assert_eq!(config.transfer.sync_policy, SyncPolicy::Checksum);
        assert_eq!(config.transfer.max_retries, TransferOptions::default().max_retries);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = EngineConfig::parse("[transfer]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn rejects_unknown_sync_policy() {
        assert!(EngineConfig::parse("[transfer]\nsync_policy = 7\n").is_err());
    }
}
