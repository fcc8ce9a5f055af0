use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BatchJobRequest, JobState, JobStatus, TransferBackend};
use crate::checkpoint::{Ledger, ReservedBatch, TransferOptions};
use crate::errors::BackendError;
use crate::retry::{retry_with_backoff, RetryPolicy};

use super::control::StopHandle;

/// Everything a batch unit needs; shared by all units of one run.
pub(crate) struct BatchContext {
    pub(crate) backend: Arc<dyn TransferBackend>,
    pub(crate) retry: RetryPolicy,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) stop: StopHandle,
    pub(crate) options: TransferOptions,
    pub(crate) source_endpoint: String,
    pub(crate) destination_endpoint: String,
    pub(crate) label: Option<String>,
}

#[derive(Debug)]
pub(crate) enum BatchOutcome {
    Completed {
        job_id: String,
        items: usize,
        bytes: u64,
    },
    Failed {
        job_id: Option<String>,
        items: usize,
        reason: String,
    },
    /// Interrupted by a stop signal; items went back to the queue.
    Released { job_id: Option<String> },
    /// The backend refused the job; items went back to the queue.
    SubmitRejected { error: String },
}

impl BatchOutcome {
    pub(crate) fn job_id(&self) -> Option<&str> {
        match self {
            BatchOutcome::Completed { job_id, .. } => Some(job_id),
            BatchOutcome::Failed { job_id, .. } | BatchOutcome::Released { job_id } => {
                job_id.as_deref()
            }
            BatchOutcome::SubmitRejected { .. } => None,
        }
    }
}

/// Submit one reserved batch, poll it to a terminal state and settle it in
/// the ledger.
pub(crate) async fn run_batch(ctx: Arc<BatchContext>, batch: ReservedBatch) -> BatchOutcome {
    let batch_id = batch.id;
    let item_count = batch.items.len();
    let bytes = batch.total_bytes;
    let request = BatchJobRequest::new(
        &ctx.source_endpoint,
        &ctx.destination_endpoint,
        batch.items,
        &ctx.options,
        ctx.label.clone(),
    );

    let submitted = tokio::select! {
        result = submit_job(ctx.backend.as_ref(), &ctx.retry, &request) => result,
        _ = ctx.stop.stopped() => {
            ctx.ledger.release_batch(batch_id);
            return BatchOutcome::Released { job_id: None };
        }
    };
    let job_id = match submitted {
        Ok(job_id) => job_id,
        Err(err) => {
            log::warn!("submission of {item_count} item(s) rejected: {err}");
            ctx.ledger.release_batch(batch_id);
            return BatchOutcome::SubmitRejected {
                error: err.to_string(),
            };
        }
    };

    ctx.ledger.attach_job(batch_id, &job_id);
    log::info!("submitted job {job_id} with {item_count} item(s), {bytes} bytes");

    let timeout = ctx.options.poll_timeout();
    let polled = tokio::select! {
        result = tokio::time::timeout(
            timeout,
            poll_until_terminal(ctx.backend.as_ref(), &ctx.retry, &job_id, ctx.options.poll_interval()),
        ) => result,
        _ = ctx.stop.stopped() => {
            log::debug!("job {job_id} interrupted; returning {item_count} item(s) to the queue");
            ctx.ledger.release_batch(batch_id);
            return BatchOutcome::Released { job_id: Some(job_id) };
        }
    };

    let failure = match polled {
        Ok(Ok(status)) if status.state == JobState::Succeeded => {
            ctx.ledger.complete_batch(batch_id);
            log::info!(
                "job {job_id} succeeded ({} file(s), {} bytes moved)",
                status.files_transferred,
                status.bytes_transferred
            );
            return BatchOutcome::Completed {
                job_id,
                items: item_count,
                bytes,
            };
        }
        Ok(Ok(status)) => describe_failure(&status),
        Ok(Err(err)) => format!("status polling failed: {err}"),
        Err(_) => format!("job did not finish within {timeout:?}"),
    };

    log::warn!("job {job_id} failed: {failure}");
    ctx.ledger.fail_batch(batch_id, &failure);
    BatchOutcome::Failed {
        job_id: Some(job_id),
        items: item_count,
        reason: failure,
    }
}

pub(crate) async fn submit_job(
    backend: &dyn TransferBackend,
    retry: &RetryPolicy,
    request: &BatchJobRequest,
) -> Result<String, BackendError> {
    retry_with_backoff(
        retry,
        move || backend.submit_batch_job(request),
        BackendError::is_retryable,
    )
    .await
}

/// Poll until the job leaves `ACTIVE`. The first poll happens immediately.
pub(crate) async fn poll_until_terminal(
    backend: &dyn TransferBackend,
    retry: &RetryPolicy,
    job_id: &str,
    interval: Duration,
) -> Result<JobStatus, BackendError> {
    loop {
        let status = retry_with_backoff(
            retry,
            move || backend.get_job_status(job_id),
            BackendError::is_retryable,
        )
        .await?;
        if status.state.is_terminal() {
            return Ok(status);
        }
        log::trace!(
            "job {job_id} active: {} file(s), {} bytes so far",
            status.files_transferred,
            status.bytes_transferred
        );
        tokio::time::sleep(interval).await;
    }
}

pub(crate) fn describe_failure(status: &JobStatus) -> String {
    let state = match status.state {
        JobState::Cancelled => "cancelled",
        _ => "failed",
    };
    match &status.message {
        Some(message) => format!("job {state}: {message}"),
        None => format!("job {state}"),
    }
}
