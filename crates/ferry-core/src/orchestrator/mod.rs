//! Resumable transfer orchestration.
//!
//! A transfer is planned once into a checkpoint record, then driven by
//! [`Orchestrator::resume`] until every item has completed or exhausted its
//! retry budget. The record is the only state that survives a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use eyre::{bail, Result, WrapErr};
use parking_lot::Mutex;

use crate::backend::TransferBackend;
use crate::checkpoint::{
    validate_checkpoint_id, CheckpointState, CheckpointStore, FileCheckpointStore, Ledger,
    TransferOptions, TransferPhase,
};
use crate::config::EngineConfig;
use crate::errors::is_not_found;
use crate::retry::RetryPolicy;

mod control;
mod jobs;
mod options;
mod planning;
mod progress;
mod runner;
mod streaming;
mod summary;

pub use control::{StopHandle, StopReason};
pub use options::{ResumeOptions, TransferRequest};
pub use progress::ProgressCallback;
pub use streaming::{StreamStatus, StreamSummary, StreamingTransfer};
pub use summary::ResumeResult;

use control::RunControl;
use jobs::BatchContext;
use planning::PlanOutcome;
use progress::{ProgressNotifier, ProgressSink};
use runner::{drive, persist, save_unless_cancelled, RunContext};

/// A transfer being planned or driven by this orchestrator.
#[derive(Clone)]
struct ActiveRun {
    control: RunControl,
    /// Set once planning is done and the run has a live ledger.
    ledger: Option<Arc<Ledger>>,
}

type ActiveRuns = Arc<Mutex<HashMap<String, ActiveRun>>>;

/// Removes a run from the registry when `create` or `resume` returns.
struct ActiveGuard {
    runs: ActiveRuns,
    checkpoint_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.checkpoint_id);
    }
}

pub struct Orchestrator {
    backend: Arc<dyn TransferBackend>,
    store: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    defaults: TransferOptions,
    progress: Option<ProgressSink>,
    active: ActiveRuns,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn TransferBackend>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            backend,
            store,
            retry: RetryPolicy::default(),
            defaults: TransferOptions::default(),
            progress: None,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// File-backed orchestrator using the configured checkpoint directory and
    /// default transfer options.
    pub fn from_config(config: &EngineConfig, backend: Arc<dyn TransferBackend>) -> Result<Self> {
        let dir = config.resolved_checkpoint_dir()?;
        let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir));
        Ok(Self::new(backend, store).with_defaults(config.transfer.clone()))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Options used by [`create_with_defaults`](Self::create_with_defaults).
    pub fn with_defaults(mut self, defaults: TransferOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Observe progress. The callback is never invoked concurrently, even
    /// when several transfers run on this orchestrator.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(ProgressSink::new(callback));
        self
    }

    pub fn defaults(&self) -> &TransferOptions {
        &self.defaults
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Plan a new transfer and persist it. Returns the checkpoint id; nothing
    /// is submitted until [`resume`](Self::resume).
    ///
    /// The transfer can be stopped or cancelled while it is being planned. A
    /// stopped transfer keeps its `Planning` record and is planned again on
    /// resume; a cancelled one is an error.
    pub async fn create(&self, request: TransferRequest, options: TransferOptions) -> Result<String> {
        options.validate()?;
        let mut state = CheckpointState::new(request.task_info(), options);
        let checkpoint_id = state.checkpoint_id.clone();
        let (control, _guard) = self.register(&checkpoint_id)?;

        let outcome = planning::plan_transfer(
            &mut state,
            Arc::clone(&self.backend),
            &self.retry,
            self.store.as_ref(),
            &control,
            true,
        )
        .await?;
        match outcome {
            PlanOutcome::Planned(_) => {}
            PlanOutcome::Interrupted(StopReason::Cancelled) => {
                bail!("transfer {checkpoint_id} was cancelled while planning")
            }
            PlanOutcome::Interrupted(reason) => {
                log::info!(
                    "transfer {checkpoint_id} stopped while planning ({reason:?}); resume plans it again"
                );
            }
        }
        Ok(checkpoint_id)
    }

    pub async fn create_with_defaults(&self, request: TransferRequest) -> Result<String> {
        self.create(request, self.defaults.clone()).await
    }

    /// Drive a transfer until it completes, fails, is stopped or cancelled.
    ///
    /// Per-item failures and rejected submissions are reported in the
    /// result. Errors are returned only for unknown or invalid ids and
    /// checkpoint I/O.
    pub async fn resume(&self, checkpoint_id: &str, overrides: ResumeOptions) -> Result<ResumeResult> {
        validate_checkpoint_id(checkpoint_id)?;
        let started = Instant::now();
        let (control, _guard) = self.register(checkpoint_id)?;

        let mut state = self
            .store
            .load(checkpoint_id)
            .await
            .wrap_err_with(|| format!("failed to resume {checkpoint_id}"))?;
        overrides.apply(&mut state.options);
        state.options.validate()?;

        if needs_planning(&state) {
            log::info!("transfer {checkpoint_id} never finished planning; planning again");
            let outcome = planning::plan_transfer(
                &mut state,
                Arc::clone(&self.backend),
                &self.retry,
                self.store.as_ref(),
                &control,
                false,
            )
            .await?;
            if let PlanOutcome::Interrupted(reason) = outcome {
                if reason == StopReason::Cancelled {
                    state.phase = TransferPhase::Cancelled;
                }
                log::info!("transfer {checkpoint_id} interrupted while planning ({reason:?})");
                return Ok(ResumeResult::from_state(&state, Vec::new(), false, started.elapsed()));
            }
        }

        if !state.current_tasks.is_empty() {
            log::warn!(
                "transfer {checkpoint_id} has {} job(s) left from an interrupted run ({}); their items will be resubmitted",
                state.current_tasks.len(),
                state.current_tasks.join(", ")
            );
        }

        let options = state.options.clone();
        let max_retries = options.max_retries;
        let task_info = state.task_info.clone();
        let loaded_phase = state.phase;
        let had_stale_tasks = !state.current_tasks.is_empty();
        let ledger = Arc::new(Ledger::new(state));
        if let Some(run) = self.active.lock().get_mut(checkpoint_id) {
            run.ledger = Some(Arc::clone(&ledger));
        }
        let requeued = ledger.requeue_failures(max_retries);
        if requeued > 0 {
            log::info!("transfer {checkpoint_id}: {requeued} failed item(s) queued for retry");
        }

        if !ledger.has_work() {
            let phase = settled_phase(&ledger);
            if phase != loaded_phase || had_stale_tasks {
                ledger.set_phase(phase);
                if phase == TransferPhase::Completed {
                    ledger.set_error(None);
                }
                save_unless_cancelled(self.store.as_ref(), &control, true, || ledger.snapshot())
                    .await?;
            }
            let mut snapshot = ledger.snapshot();
            if control.stop.reason() == Some(StopReason::Cancelled) {
                snapshot.phase = TransferPhase::Cancelled;
            }
            log::debug!("transfer {checkpoint_id} has no work left ({:?})", snapshot.phase);
            return Ok(ResumeResult::from_state(&snapshot, Vec::new(), false, started.elapsed()));
        }

        let notifier = ProgressNotifier::spawn(self.progress.clone());
        let ctx = RunContext {
            store: self.store.as_ref(),
            ledger: Arc::clone(&ledger),
            control: control.clone(),
            progress: &notifier,
        };

        ledger.set_phase(TransferPhase::Running);
        ledger.set_error(None);
        persist(&ctx).await?;
        log::info!(
            "resuming {checkpoint_id}: {} item(s), {} bytes remaining",
            ledger.stats().remaining_items,
            ledger.stats().remaining_bytes
        );

        let batch_ctx = Arc::new(BatchContext {
            backend: Arc::clone(&self.backend),
            retry: self.retry.clone(),
            ledger: Arc::clone(&ledger),
            stop: control.stop.clone(),
            options,
            source_endpoint: task_info.source_endpoint,
            destination_endpoint: task_info.destination_endpoint,
            label: task_info.label,
        });
        let outcome = drive(&ctx, batch_ctx, overrides.deadline).await?;

        if control.stop.reason() != Some(StopReason::Cancelled) {
            if let Some(error) = &outcome.halted {
                ledger.set_phase(TransferPhase::Failed);
                ledger.set_error(Some(error.clone()));
            } else if control.stop.is_stopped() {
                ledger.set_phase(TransferPhase::Running);
            } else {
                let phase = settled_phase(&ledger);
                ledger.set_phase(phase);
                if phase == TransferPhase::Failed {
                    ledger.set_error(Some(format!(
                        "{} item(s) failed after {} retries",
                        ledger.failed_len(),
                        max_retries
                    )));
                }
            }
            persist(&ctx).await?;
        }
        if control.stop.reason() == Some(StopReason::Cancelled) {
            ledger.set_phase(TransferPhase::Cancelled);
        }

        let snapshot = ledger.snapshot();
        notifier.notify(|| snapshot.clone());
        notifier.finish().await;

        let result = ResumeResult::from_state(
            &snapshot,
            outcome.job_ids,
            outcome.halted.is_some(),
            started.elapsed(),
        );
        log::info!(
            "transfer {checkpoint_id} {:?}: {} completed, {} failed, {} remaining in {:?}",
            result.phase,
            result.completed_items,
            result.failed_items,
            result.remaining_items,
            result.duration
        );
        Ok(result)
    }

    /// Live state of a running transfer, otherwise the saved record.
    pub async fn status(&self, checkpoint_id: &str) -> Result<CheckpointState> {
        validate_checkpoint_id(checkpoint_id)?;
        let live = self
            .active
            .lock()
            .get(checkpoint_id)
            .and_then(|run| run.ledger.clone());
        if let Some(ledger) = live {
            return Ok(ledger.snapshot());
        }
        self.store.load(checkpoint_id).await
    }

    /// Delete the checkpoint. A running transfer stops scheduling and saves
    /// nothing further; jobs already submitted are not retracted.
    pub async fn cancel(&self, checkpoint_id: &str) -> Result<()> {
        validate_checkpoint_id(checkpoint_id)?;
        let running = self.active.lock().get(checkpoint_id).cloned();
        match running {
            Some(run) => {
                run.control.stop.stop(StopReason::Cancelled);
                let _guard = run.control.persist_lock.lock().await;
                match self.store.delete(checkpoint_id).await {
                    Err(err) if is_not_found(&err) => {
                        log::debug!("transfer {checkpoint_id} cancelled before its first save");
                    }
                    other => other?,
                }
            }
            None => self.store.delete(checkpoint_id).await?,
        }
        log::info!("transfer {checkpoint_id} cancelled");
        Ok(())
    }

    /// Ask a running transfer to stop after saving its progress. Returns
    /// false when the transfer is not running in this orchestrator.
    pub fn stop(&self, checkpoint_id: &str) -> bool {
        let running = self.active.lock().get(checkpoint_id).cloned();
        match running {
            Some(run) => {
                log::info!("stop requested for {checkpoint_id}");
                run.control.stop.stop(StopReason::Requested);
                true
            }
            None => false,
        }
    }

    /// Claim `checkpoint_id` for one `create` or `resume` call.
    fn register(&self, checkpoint_id: &str) -> Result<(RunControl, ActiveGuard)> {
        let mut active = self.active.lock();
        if active.contains_key(checkpoint_id) {
            bail!("transfer {checkpoint_id} is already running");
        }
        let control = RunControl::default();
        active.insert(
            checkpoint_id.to_string(),
            ActiveRun {
                control: control.clone(),
                ledger: None,
            },
        );
        let guard = ActiveGuard {
            runs: Arc::clone(&self.active),
            checkpoint_id: checkpoint_id.to_string(),
        };
        Ok((control, guard))
    }

    /// True while the transfer is being planned or driven here.
    pub fn is_running(&self, checkpoint_id: &str) -> bool {
        self.active.lock().contains_key(checkpoint_id)
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    /// Delete every saved checkpoint in the `Completed` phase. Returns the removed ids.
    pub async fn cleanup_finished(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for checkpoint_id in self.store.list().await? {
            if self.is_running(&checkpoint_id) {
                continue;
            }
            let state = match self.store.load(&checkpoint_id).await {
                Ok(state) => state,
                Err(err) => {
                    log::warn!("skipping unreadable checkpoint {checkpoint_id}: {err:#}");
                    continue;
                }
            };
            if state.phase == TransferPhase::Completed {
                self.store.delete(&checkpoint_id).await?;
                removed.push(checkpoint_id);
            }
        }
        if !removed.is_empty() {
            log::info!("removed {} completed checkpoint(s)", removed.len());
        }
        Ok(removed)
    }
}

/// Planning was interrupted, or failed before anything was queued.
fn needs_planning(state: &CheckpointState) -> bool {
    match state.phase {
        TransferPhase::Planning => true,
        TransferPhase::Failed => state.stats.total_items == 0 && state.last_error.is_some(),
        _ => false,
    }
}

/// Terminal phase for a ledger with nothing queued or in flight.
fn settled_phase(ledger: &Ledger) -> TransferPhase {
    if ledger.failed_len() == 0 {
        TransferPhase::Completed
    } else {
        TransferPhase::Failed
    }
}
