use std::sync::Arc;
use std::time::Instant;

use eyre::{Result, WrapErr};

use crate::backend::TransferBackend;
use crate::checkpoint::{CheckpointState, CheckpointStore, TransferPhase};
use crate::enumeration::{EnumeratorOptions, StreamingEnumerator};
use crate::planner::{BatchPlanner, PlanTotals};
use crate::retry::RetryPolicy;

use super::control::{RunControl, StopReason};
use super::runner::save_unless_cancelled;

#[derive(Debug, Clone, Copy)]
pub(crate) enum PlanOutcome {
    Planned(PlanTotals),
    /// The stop signal was raised before every batch was queued. Unless the
    /// reason is `Cancelled`, the record is left in `Planning`.
    Interrupted(StopReason),
}

/// Enumerate the source tree into `state.pending_items`.
///
/// The record is saved in `Planning` before the walk starts and in `Running`
/// once every batch is queued. A listing failure is recorded as `Failed`
/// with `last_error` and returned. Every save goes through `control`, so a
/// cancelled transfer is never written back. `fresh` is set when the record
/// has not been saved yet.
pub(crate) async fn plan_transfer(
    state: &mut CheckpointState,
    backend: Arc<dyn TransferBackend>,
    retry: &RetryPolicy,
    store: &dyn CheckpointStore,
    control: &RunControl,
    fresh: bool,
) -> Result<PlanOutcome> {
    let checkpoint_id = state.checkpoint_id.clone();
    state.phase = TransferPhase::Planning;
    state.pending_items.clear();
    state.last_error = None;
    state.recompute_stats();
    state.touch();
    if !save_unless_cancelled(store, control, !fresh, || state.clone()).await? {
        return Ok(PlanOutcome::Interrupted(StopReason::Cancelled));
    }

    let info = &state.task_info;
    log::info!(
        "planning {checkpoint_id}: {}:{} -> {}:{}",
        info.source_endpoint,
        info.source_path,
        info.destination_endpoint,
        info.destination_path
    );
    let started = Instant::now();

    let enumerator = StreamingEnumerator::new(
        backend,
        info.source_endpoint.clone(),
        info.source_path.clone(),
        EnumeratorOptions::from(&state.options),
    )
    .with_retry_policy(retry.clone());
    let mut planner = BatchPlanner::new(
        enumerator,
        info.source_path.clone(),
        info.destination_path.clone(),
        state.options.batch_size,
    );

    let stopped = control.stop.stopped();
    tokio::pin!(stopped);
    loop {
        let step = tokio::select! {
            next = planner.next_batch() => Ok(next),
            reason = &mut stopped => Err(reason),
        };
        match step {
            Ok(Ok(Some(batch))) => state.pending_items.extend(batch.items),
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                log::warn!("planning {checkpoint_id} failed: {err:#}");
                state.phase = TransferPhase::Failed;
                state.last_error = Some(format!("{err:#}"));
                state.pending_items.clear();
                state.recompute_stats();
                state.touch();
                if !save_unless_cancelled(store, control, true, || state.clone()).await? {
                    return Ok(PlanOutcome::Interrupted(StopReason::Cancelled));
                }
                return Err(err).wrap_err_with(|| format!("planning transfer {checkpoint_id} failed"));
            }
            Err(reason) => {
                planner.close();
                log::info!(
                    "planning {checkpoint_id} interrupted ({reason:?}) after {} file(s)",
                    state.pending_items.len()
                );
                state.pending_items.clear();
                state.recompute_stats();
                return Ok(PlanOutcome::Interrupted(reason));
            }
        }
    }

    let totals = planner.totals();
    state.recompute_stats();
    state.phase = TransferPhase::Running;
    state.touch();
    if !save_unless_cancelled(store, control, true, || state.clone()).await? {
        log::info!("planning {checkpoint_id} finished after the transfer was cancelled");
        return Ok(PlanOutcome::Interrupted(StopReason::Cancelled));
    }

    log::info!(
        "planned {checkpoint_id}: {} file(s), {} bytes in {} batch(es) ({} entries) in {:?}",
        totals.files,
        totals.bytes,
        totals.batches,
        totals.entries_seen,
        started.elapsed()
    );
    Ok(PlanOutcome::Planned(totals))
}
