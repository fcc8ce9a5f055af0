use std::time::Duration;

use crate::checkpoint::{CheckpointState, TransferPhase};

/// Outcome of one `Orchestrator::resume` call.
#[derive(Clone, Debug)]
pub struct ResumeResult {
    pub checkpoint_id: String,
    pub phase: TransferPhase,
    /// Every item was transferred.
    pub completed: bool,
    /// A submission was rejected and the run stopped early. The rejected
    /// items are still pending.
    pub halted: bool,
    pub completed_items: u64,
    pub completed_bytes: u64,
    pub failed_items: u64,
    pub failed_bytes: u64,
    pub remaining_items: u64,
    pub remaining_bytes: u64,
    /// Backend jobs submitted during this call.
    pub job_ids: Vec<String>,
    pub last_error: Option<String>,
    pub duration: Duration,
}

impl ResumeResult {
    pub(crate) fn from_state(
        state: &CheckpointState,
        job_ids: Vec<String>,
        halted: bool,
        duration: Duration,
    ) -> Self {
        let stats = &state.stats;
        Self {
            checkpoint_id: state.checkpoint_id.clone(),
            phase: state.phase,
            completed: state.phase == TransferPhase::Completed,
            halted,
            completed_items: stats.completed_items,
            completed_bytes: stats.completed_bytes,
            failed_items: stats.failed_items,
            failed_bytes: stats.failed_bytes,
            remaining_items: stats.remaining_items,
            remaining_bytes: stats.remaining_bytes,
            job_ids,
            last_error: state.last_error.clone(),
            duration,
        }
    }
}
