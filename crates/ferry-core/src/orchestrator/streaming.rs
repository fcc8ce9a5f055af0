use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{eyre, Result};
use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::backend::{BatchJobRequest, JobState, TransferBackend};
use crate::checkpoint::TransferOptions;
use crate::enumeration::{EnumeratorOptions, StreamingEnumerator};
use crate::planner::{Batch, BatchPlanner};
use crate::retry::RetryPolicy;

use super::control::{StopHandle, StopReason};
use super::jobs::{describe_failure, poll_until_terminal, submit_job};
use super::options::TransferRequest;

/// Live counters of a [`StreamingTransfer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub planned_files: u64,
    pub planned_bytes: u64,
    pub batches_submitted: u64,
    pub completed_files: u64,
    pub completed_bytes: u64,
    pub failed_files: u64,
    pub failed_bytes: u64,
    pub active_jobs: Vec<String>,
    pub finished: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub planned_files: u64,
    pub planned_bytes: u64,
    pub completed_files: u64,
    pub completed_bytes: u64,
    pub failed_files: u64,
    pub failed_bytes: u64,
    pub batches: u64,
    pub job_ids: Vec<String>,
    /// One message per batch that gave up.
    pub failures: Vec<String>,
    pub stopped: Option<StopReason>,
    pub duration: Duration,
}

impl StreamSummary {
    pub fn is_success(&self) -> bool {
        self.failed_files == 0 && self.stopped.is_none()
    }
}

/// One-shot transfer that streams enumeration straight into submission.
///
/// Memory stays bounded by the batch size and the number of concurrent
/// jobs. Nothing is persisted: an interrupted run starts over from scratch.
pub struct StreamingTransfer {
    backend: Arc<dyn TransferBackend>,
    request: TransferRequest,
    options: TransferOptions,
    retry: RetryPolicy,
    status: Arc<Mutex<StreamStatus>>,
    stop: StopHandle,
}

struct StreamUnit {
    backend: Arc<dyn TransferBackend>,
    retry: RetryPolicy,
    options: TransferOptions,
    source_endpoint: String,
    destination_endpoint: String,
    label: Option<String>,
    status: Arc<Mutex<StreamStatus>>,
    stop: StopHandle,
}

enum StreamOutcome {
    Completed {
        files: u64,
        bytes: u64,
        job_ids: Vec<String>,
    },
    Failed {
        files: u64,
        bytes: u64,
        job_ids: Vec<String>,
        error: String,
    },
    Stopped {
        job_ids: Vec<String>,
    },
}

enum AttemptError {
    /// The backend refused the job; resubmitting will not help.
    Rejected(String),
    JobFailed(String),
}

impl StreamingTransfer {
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        request: TransferRequest,
        options: TransferOptions,
    ) -> Self {
        Self {
            backend,
            request,
            options,
            retry: RetryPolicy::default(),
            status: Arc::new(Mutex::new(StreamStatus::default())),
            stop: StopHandle::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn status(&self) -> StreamStatus {
        self.status.lock().clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run to completion. Failed batches are reported in the summary; an
    /// enumeration failure is returned as an error once in-flight jobs settle.
    pub async fn run(&self) -> Result<StreamSummary> {
        self.options.validate()?;
        let started = Instant::now();
        let slots = self.options.max_concurrent_tasks.max(1);

        let enumerator = StreamingEnumerator::new(
            Arc::clone(&self.backend),
            self.request.source_endpoint.clone(),
            self.request.source_path.clone(),
            EnumeratorOptions::from(&self.options),
        )
        .with_retry_policy(self.retry.clone());
        let mut planner = BatchPlanner::new(
            enumerator,
            self.request.source_path.clone(),
            self.request.destination_path.clone(),
            self.options.batch_size,
        );

        let unit = Arc::new(StreamUnit {
            backend: Arc::clone(&self.backend),
            retry: self.retry.clone(),
            options: self.options.clone(),
            source_endpoint: self.request.source_endpoint.clone(),
            destination_endpoint: self.request.destination_endpoint.clone(),
            label: self.request.label.clone(),
            status: Arc::clone(&self.status),
            stop: self.stop.clone(),
        });

        let mut summary = StreamSummary::default();
        let mut tasks: JoinSet<StreamOutcome> = JoinSet::new();
        let mut exhausted = false;
        let mut planning_error: Option<eyre::Report> = None;

        log::info!(
            "streaming {}:{} -> {}:{}",
            self.request.source_endpoint,
            self.request.source_path,
            self.request.destination_endpoint,
            self.request.destination_path
        );

        loop {
            while !exhausted && !self.stop.is_stopped() && tasks.len() < slots {
                let next = tokio::select! {
                    next = planner.next_batch() => next,
                    _ = self.stop.stopped() => break,
                };
                match next {
                    Ok(Some(batch)) => {
                        summary.batches += 1;
                        summary.planned_files += batch.len() as u64;
                        summary.planned_bytes += batch.total_bytes;
                        {
                            let mut status = self.status.lock();
                            status.planned_files = summary.planned_files;
                            status.planned_bytes = summary.planned_bytes;
                        }
                        tasks.spawn(stream_batch(Arc::clone(&unit), batch));
                    }
                    Ok(None) => exhausted = true,
                    Err(err) => {
                        log::warn!("streaming enumeration failed: {err:#}");
                        self.status.lock().last_error = Some(format!("{err:#}"));
                        planning_error = Some(err);
                        exhausted = true;
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined.map_err(|err| eyre!("batch task aborted: {err}"))? {
                StreamOutcome::Completed {
                    files,
                    bytes,
                    job_ids,
                } => {
                    summary.completed_files += files;
                    summary.completed_bytes += bytes;
                    summary.job_ids.extend(job_ids);
                }
                StreamOutcome::Failed {
                    files,
                    bytes,
                    job_ids,
                    error,
                } => {
                    summary.failed_files += files;
                    summary.failed_bytes += bytes;
                    summary.job_ids.extend(job_ids);
                    summary.failures.push(error);
                }
                StreamOutcome::Stopped { job_ids } => summary.job_ids.extend(job_ids),
            }
        }

        planner.close();
        summary.stopped = self.stop.reason();
        summary.duration = started.elapsed();
        self.status.lock().finished = true;

        if let Some(err) = planning_error {
            return Err(err);
        }
        log::info!(
            "streaming finished: {} of {} file(s) completed, {} failed in {:?}",
            summary.completed_files,
            summary.planned_files,
            summary.failed_files,
            summary.duration
        );
        Ok(summary)
    }
}

/// Submit a batch, resubmitting the whole batch after a failed job up to
/// `max_retries` times.
async fn stream_batch(unit: Arc<StreamUnit>, batch: Batch) -> StreamOutcome {
    let files = batch.len() as u64;
    let bytes = batch.total_bytes;
    let request = BatchJobRequest::new(
        &unit.source_endpoint,
        &unit.destination_endpoint,
        batch.items,
        &unit.options,
        unit.label.clone(),
    );
    let mut job_ids = Vec::new();
    let mut attempt = 0u32;

    loop {
        let result = tokio::select! {
            result = attempt_once(&unit, &request, &mut job_ids) => result,
            _ = unit.stop.stopped() => return StreamOutcome::Stopped { job_ids },
        };

        let error = match result {
            Ok(()) => {
                let mut status = unit.status.lock();
                status.completed_files += files;
                status.completed_bytes += bytes;
                return StreamOutcome::Completed {
                    files,
                    bytes,
                    job_ids,
                };
            }
            Err(AttemptError::JobFailed(error)) if attempt < unit.options.max_retries => {
                attempt += 1;
                log::warn!(
                    "batch of {files} file(s) failed ({error}); resubmitting ({attempt}/{})",
                    unit.options.max_retries
                );
                continue;
            }
            Err(AttemptError::JobFailed(error)) | Err(AttemptError::Rejected(error)) => error,
        };

        let mut status = unit.status.lock();
        status.failed_files += files;
        status.failed_bytes += bytes;
        status.last_error = Some(error.clone());
        return StreamOutcome::Failed {
            files,
            bytes,
            job_ids,
            error,
        };
    }
}

async fn attempt_once(
    unit: &StreamUnit,
    request: &BatchJobRequest,
    job_ids: &mut Vec<String>,
) -> Result<(), AttemptError> {
    let job_id = submit_job(unit.backend.as_ref(), &unit.retry, request)
        .await
        .map_err(|err| AttemptError::Rejected(err.to_string()))?;
    job_ids.push(job_id.clone());
    {
        let mut status = unit.status.lock();
        status.batches_submitted += 1;
        status.active_jobs.push(job_id.clone());
    }

    let timeout = unit.options.poll_timeout();
    let polled = tokio::time::timeout(
        timeout,
        poll_until_terminal(
            unit.backend.as_ref(),
            &unit.retry,
            &job_id,
            unit.options.poll_interval(),
        ),
    )
    .await;
    unit.status.lock().active_jobs.retain(|id| id != &job_id);

    match polled {
        Ok(Ok(status)) if status.state == JobState::Succeeded => Ok(()),
        Ok(Ok(status)) => Err(AttemptError::JobFailed(describe_failure(&status))),
        Ok(Err(err)) => Err(AttemptError::JobFailed(format!("status polling failed: {err}"))),
        Err(_) => Err(AttemptError::JobFailed(format!(
            "job {job_id} did not finish within {timeout:?}"
        ))),
    }
}
