mod common;

use std::sync::Arc;

use eyre::Result;

use common::{fast_options, request, sample_backend};
use ferry_core::checkpoint::{CheckpointStore, FileCheckpointStore, TransferPhase};
use ferry_core::config::EngineConfig;
use ferry_core::orchestrator::{Orchestrator, ResumeOptions};
use ferry_core::retry::RetryPolicy;

#[tokio::test]
async fn file_store_survives_a_new_orchestrator() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let backend = Arc::new(sample_backend());
    let store = Arc::new(FileCheckpointStore::new(temp.path()));

    let id = {
        let orchestrator = Orchestrator::new(backend.clone(), store.clone())
            .with_retry_policy(RetryPolicy::immediate(2));
        orchestrator.create(request(), fast_options(2)).await?
    };
    assert!(store.record_path(&id).exists());

    let planned = store.load(&id).await?;
    assert_eq!(planned.phase, TransferPhase::Running);
    assert_eq!(planned.pending_items.len(), 3);

    // A fresh process picks the record up from disk.
    let reopened = Orchestrator::new(backend.clone(), Arc::new(FileCheckpointStore::new(temp.path())))
        .with_retry_policy(RetryPolicy::immediate(2));
    let result = reopened.resume(&id, ResumeOptions::default()).await?;
    assert!(result.completed);

    let raw = std::fs::read_to_string(store.record_path(&id))?;
    assert!(raw.contains("\"phase\": \"completed\""));
    assert!(raw.contains("\"completed_items\""));

    let leftovers: Vec<_> = std::fs::read_dir(temp.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[tokio::test]
async fn orchestrator_from_config_file() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let checkpoints = temp.path().join("checkpoints");
    let config_path = temp.path().join("ferry.toml");
    std::fs::write(
        &config_path,
        format!(
            "checkpoint_dir = '{}'\n\n[transfer]\nbatch_size = 1\npoll_interval_ms = 1\nmax_retries = 0\n",
            checkpoints.display()
        ),
    )?;

    let config = EngineConfig::load(&config_path).await?;
    assert_eq!(config.transfer.batch_size, 1);

    let orchestrator = Orchestrator::from_config(&config, Arc::new(sample_backend()))?
        .with_retry_policy(RetryPolicy::none());
    let id = orchestrator.create_with_defaults(request()).await?;
    let result = orchestrator.resume(&id, ResumeOptions::default()).await?;

    assert!(result.completed);
    assert_eq!(result.job_ids.len(), 3);
    assert!(checkpoints.join(format!("{id}.json")).exists());
    Ok(())
}

#[tokio::test]
async fn cancel_without_running_transfer_removes_file() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let store = Arc::new(FileCheckpointStore::new(temp.path()));
    let orchestrator = Orchestrator::new(Arc::new(sample_backend()), store.clone());

    let id = orchestrator.create(request(), fast_options(2)).await?;
    orchestrator.cancel(&id).await?;
    assert!(!store.record_path(&id).exists());
    assert!(orchestrator.cancel(&id).await.is_err());
    Ok(())
}
