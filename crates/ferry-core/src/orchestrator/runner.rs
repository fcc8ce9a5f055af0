use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};

use crate::checkpoint::{CheckpointState, CheckpointStore, Ledger};

use super::control::{RunControl, StopReason};
use super::jobs::{run_batch, BatchContext, BatchOutcome};
use super::progress::ProgressNotifier;

/// Handles shared between the runner and `Orchestrator::cancel`.
pub(crate) struct RunContext<'a> {
    pub(crate) store: &'a dyn CheckpointStore,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) control: RunControl,
    pub(crate) progress: &'a ProgressNotifier,
}

#[derive(Debug, Default)]
pub(crate) struct RunOutcome {
    pub(crate) job_ids: Vec<String>,
    /// Error of the rejected submission that halted the run.
    pub(crate) halted: Option<String>,
}

/// Save `snapshot()` unless the transfer has been cancelled. With
/// `must_exist`, a record that disappeared from the store counts as a
/// cancellation. Returns whether anything was written.
pub(crate) async fn save_unless_cancelled(
    store: &dyn CheckpointStore,
    control: &RunControl,
    must_exist: bool,
    snapshot: impl FnOnce() -> CheckpointState,
) -> Result<bool> {
    let _guard = control.persist_lock.lock().await;
    if control.stop.reason() == Some(StopReason::Cancelled) {
        return Ok(false);
    }

    let state = snapshot();
    let checkpoint_id = &state.checkpoint_id;
    if must_exist && !store.exists(checkpoint_id).await? {
        log::info!("checkpoint {checkpoint_id} was removed; treating as cancelled");
        control.stop.stop(StopReason::Cancelled);
        return Ok(false);
    }

    store
        .save(&state)
        .await
        .wrap_err_with(|| format!("failed to save checkpoint {checkpoint_id}"))?;
    log::debug!(
        "checkpoint {checkpoint_id} saved ({:?}): {} pending, {} completed, {} failed",
        state.phase,
        state.pending_items.len(),
        state.completed_items.len(),
        state.failed_items.len()
    );
    Ok(true)
}

/// Save the ledger of a running transfer.
pub(crate) async fn persist(ctx: &RunContext<'_>) -> Result<bool> {
    save_unless_cancelled(ctx.store, &ctx.control, true, || ctx.ledger.snapshot()).await
}

/// Dispatch batches until the ledger runs dry, the run halts or a stop
/// signal arrives. In-flight units always settle before this returns.
pub(crate) async fn drive(
    ctx: &RunContext<'_>,
    batch_ctx: Arc<BatchContext>,
    deadline: Option<Duration>,
) -> Result<RunOutcome> {
    let options = batch_ctx.options.clone();
    let slots = options.max_concurrent_tasks.max(1);
    let mut outcome = RunOutcome::default();
    let mut tasks: JoinSet<BatchOutcome> = JoinSet::new();

    let mut ticker = time::interval(options.checkpoint_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let stopped = ctx.control.stop.stopped();
    tokio::pin!(stopped);
    let mut stop_seen = ctx.control.stop.is_stopped();

    let expired = async move {
        match deadline {
            Some(limit) => time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expired);
    let mut deadline_seen = false;

    loop {
        if outcome.halted.is_none() && !ctx.control.stop.is_stopped() {
            while tasks.len() < slots {
                let next = ctx.ledger.reserve_batch(options.batch_size).or_else(|| {
                    let requeued = ctx.ledger.requeue_failures(options.max_retries);
                    if requeued > 0 {
                        log::info!("retrying {requeued} failed item(s)");
                        ctx.ledger.reserve_batch(options.batch_size)
                    } else {
                        None
                    }
                });
                let Some(batch) = next else {
                    break;
                };
                tasks.spawn(run_batch(Arc::clone(&batch_ctx), batch));
            }
        }

        if tasks.is_empty() {
            break;
        }

        tokio::select! {
            Some(joined) = tasks.join_next() => {
                let settled = joined.map_err(|err| eyre!("batch task aborted: {err}"))?;
                if let Some(job_id) = settled.job_id() {
                    outcome.job_ids.push(job_id.to_string());
                }
                match settled {
                    BatchOutcome::SubmitRejected { error } => {
                        if outcome.halted.is_none() {
                            log::warn!("halting run: {error}");
                            outcome.halted = Some(error);
                        }
                    }
                    BatchOutcome::Completed { items, bytes, .. } => {
                        log::debug!("batch settled: {items} item(s), {bytes} bytes completed");
                    }
                    BatchOutcome::Failed { items, reason, .. } => {
                        log::debug!("batch settled: {items} item(s) failed ({reason})");
                    }
                    BatchOutcome::Released { .. } => {}
                }

                ctx.progress.notify(|| ctx.ledger.snapshot());
                if ctx.ledger.queued_len() == 0 {
                    persist(ctx).await?;
                }
            }
            _ = ticker.tick() => {
                persist(ctx).await?;
                ctx.progress.notify(|| ctx.ledger.snapshot());
            }
            reason = &mut stopped, if !stop_seen => {
                stop_seen = true;
                log::info!(
                    "transfer {} stopping ({reason:?}); waiting for {} batch(es)",
                    ctx.ledger.checkpoint_id(),
                    tasks.len()
                );
            }
            _ = &mut expired, if !deadline_seen => {
                deadline_seen = true;
                ctx.control.stop.stop(StopReason::Deadline);
            }
        }
    }

    Ok(outcome)
}
