mod common;

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;

use common::{fast_options, request, sample_backend};
use ferry_core::orchestrator::{StopReason, StreamingTransfer};
use ferry_core::retry::RetryPolicy;

#[tokio::test]
async fn streams_the_sample_tree() -> Result<()> {
    let backend = Arc::new(sample_backend());
    let transfer = StreamingTransfer::new(backend.clone(), request(), fast_options(2))
        .with_retry_policy(RetryPolicy::immediate(2));

    let summary = transfer.run().await?;
    assert!(summary.is_success());
    assert_eq!(summary.planned_files, 3);
    assert_eq!(summary.planned_bytes, 60);
    assert_eq!(summary.completed_files, 3);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.job_ids.len(), 2);
    assert!(backend.entry("dst", "/dst/b.txt").is_some());

    let status = transfer.status();
    assert!(status.finished);
    assert!(status.active_jobs.is_empty());
    assert_eq!(status.completed_bytes, 60);
    Ok(())
}

#[tokio::test]
async fn failed_batch_is_resubmitted_then_reported() -> Result<()> {
    let backend = sample_backend();
    backend.fail_jobs_with("/src/a.txt");
    backend.fail_jobs_with_times("/src/b.txt", 1);
    let backend = Arc::new(backend);

    let mut options = fast_options(1);
    options.max_retries = 1;
    let transfer = StreamingTransfer::new(backend.clone(), request(), options)
        .with_retry_policy(RetryPolicy::immediate(2));

    let summary = transfer.run().await?;
    assert!(!summary.is_success());
    assert_eq!(summary.completed_files, 2);
    assert_eq!(summary.failed_files, 1);
    assert_eq!(summary.failed_bytes, 10);
    assert_eq!(summary.failures.len(), 1);
    // a: 2 attempts, b: 2 attempts, c: 1 attempt
    assert_eq!(backend.calls().submit, 5);
    Ok(())
}

#[tokio::test]
async fn enumeration_error_is_returned() {
    let backend = sample_backend();
    backend.fail_listing("src", "/src");
    let transfer = StreamingTransfer::new(Arc::new(backend), request(), fast_options(2));

    let err = transfer.run().await.unwrap_err();
    assert!(format!("{err:#}").contains("permission denied"));
    assert!(transfer.status().last_error.is_some());
}

#[tokio::test]
async fn stop_handle_interrupts_active_jobs() -> Result<()> {
    let backend = Arc::new(sample_backend().with_polls_until_done(u32::MAX));
    let transfer = Arc::new(StreamingTransfer::new(backend, request(), fast_options(2)));
    let stop = transfer.stop_handle();

    let running = {
        let transfer = Arc::clone(&transfer);
        tokio::spawn(async move { transfer.run().await })
    };
    for _ in 0..200 {
        if !transfer.status().active_jobs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop.stop(StopReason::Requested);

    let summary = running.await??;
    assert_eq!(summary.stopped, Some(StopReason::Requested));
    assert_eq!(summary.completed_files, 0);
    assert!(!summary.is_success());
    Ok(())
}
