//! Owner of a live transfer's [`CheckpointState`].
//!
//! Every move between the pending, completed and failed buckets is a single
//! method on [`Ledger`] executed under one lock, so the cached stats can never
//! drift from the buckets. Items handed to a running batch stay counted as
//! remaining and are written back into `pending_items` whenever a snapshot is
//! taken, so a crash never loses track of them.

use std::collections::BTreeMap;

use chrono::Utc;
use parking_lot::Mutex;

use super::types::{CheckpointState, FailedItem, TransferItem, TransferPhase, TransferStats};

pub type BatchId = u64;

/// Items reserved for one backend job.
#[derive(Debug, Clone)]
pub struct ReservedBatch {
    pub id: BatchId,
    pub items: Vec<TransferItem>,
    pub total_bytes: u64,
}

#[derive(Debug)]
struct InFlight {
    job_id: Option<String>,
    items: Vec<TransferItem>,
    bytes: u64,
}

#[derive(Debug)]
struct LedgerInner {
    // `pending_items` here only holds items that have not been reserved.
    state: CheckpointState,
    in_flight: BTreeMap<BatchId, InFlight>,
    next_batch: BatchId,
}

#[derive(Debug)]
pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    /// Take ownership of `state`. Stats are rebuilt from the buckets and any
    /// job ids left in `current_tasks` are dropped; their items are still pending.
    pub fn new(mut state: CheckpointState) -> Self {
        state.current_tasks.clear();
        state.recompute_stats();
        Self {
            inner: Mutex::new(LedgerInner {
                state,
                in_flight: BTreeMap::new(),
                next_batch: 0,
            }),
        }
    }

    pub fn checkpoint_id(&self) -> String {
        self.inner.lock().state.checkpoint_id.clone()
    }

    pub fn stats(&self) -> TransferStats {
        self.inner.lock().state.stats
    }

    pub fn phase(&self) -> TransferPhase {
        self.inner.lock().state.phase
    }

    pub fn set_phase(&self, phase: TransferPhase) {
        self.inner.lock().state.phase = phase;
    }

    pub fn set_error(&self, error: Option<String>) {
        self.inner.lock().state.last_error = error;
    }

    /// Items not yet handed to a batch.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().state.pending_items.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn failed_len(&self) -> usize {
        self.inner.lock().state.failed_items.len()
    }

    /// True while anything is queued or in flight.
    pub fn has_work(&self) -> bool {
        let inner = self.inner.lock();
        !inner.state.pending_items.is_empty() || !inner.in_flight.is_empty()
    }

    /// Pop up to `max` queued items into a new in-flight batch.
    pub fn reserve_batch(&self, max: usize) -> Option<ReservedBatch> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.state.pending_items.len());
        if take == 0 {
            return None;
        }

        let items: Vec<TransferItem> = inner.state.pending_items.drain(..take).collect();
        let total_bytes = items.iter().map(|item| item.size).sum();
        let id = inner.next_batch;
        inner.next_batch += 1;
        inner.in_flight.insert(
            id,
            InFlight {
                job_id: None,
                items: items.clone(),
                bytes: total_bytes,
            },
        );

        Some(ReservedBatch {
            id,
            items,
            total_bytes,
        })
    }

    pub fn attach_job(&self, batch: BatchId, job_id: &str) {
        if let Some(flight) = self.inner.lock().in_flight.get_mut(&batch) {
            flight.job_id = Some(job_id.to_string());
        }
    }

    /// Move a finished batch into `completed_items`. Returns the item count.
    pub fn complete_batch(&self, batch: BatchId) -> usize {
        let mut inner = self.inner.lock();
        let Some(flight) = inner.in_flight.remove(&batch) else {
            return 0;
        };
        let count = flight.items.len();
        inner
            .state
            .stats
            .move_remaining_to_completed(count as u64, flight.bytes);
        inner.state.completed_items.extend(flight.items);
        debug_assert!(inner.state.stats.is_consistent());
        count
    }

    /// Move a failed batch into `failed_items`, each item keeping its retry count.
    pub fn fail_batch(&self, batch: BatchId, error: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(flight) = inner.in_flight.remove(&batch) else {
            return 0;
        };
        let count = flight.items.len();
        inner
            .state
            .stats
            .move_remaining_to_failed(count as u64, flight.bytes);
        let now = Utc::now();
        inner
            .state
            .failed_items
            .extend(flight.items.into_iter().map(|item| FailedItem {
                retry_count: item.retry_count,
                item,
                error: error.to_string(),
                last_attempt: now,
            }));
        debug_assert!(inner.state.stats.is_consistent());
        count
    }

    /// Return a batch to the front of the queue untouched.
    pub fn release_batch(&self, batch: BatchId) -> usize {
        let mut inner = self.inner.lock();
        let Some(flight) = inner.in_flight.remove(&batch) else {
            return 0;
        };
        let count = flight.items.len();
        for item in flight.items.into_iter().rev() {
            inner.state.pending_items.push_front(item);
        }
        count
    }

    /// Re-queue every failed item still under `max_retries`, bumping its retry count.
    /// Items at or over budget stay in `failed_items`.
    pub fn requeue_failures(&self, max_retries: u32) -> usize {
        let mut inner = self.inner.lock();
        if inner.state.failed_items.is_empty() {
            return 0;
        }

        let failed = std::mem::take(&mut inner.state.failed_items);
        let mut moved_items = 0u64;
        let mut moved_bytes = 0u64;
        for failed in failed {
            if failed.retry_count < max_retries {
                moved_items += 1;
                moved_bytes += failed.item.size;
                let retried = TransferItem {
                    retry_count: failed.retry_count.saturating_add(1),
                    ..failed.item
                };
                inner.state.pending_items.push_back(retried);
            } else {
                inner.state.failed_items.push(failed);
            }
        }
        inner
            .state
            .stats
            .move_failed_to_remaining(moved_items, moved_bytes);
        debug_assert!(inner.state.stats.is_consistent());
        moved_items as usize
    }

    /// Durable view of the transfer: in-flight items are listed first in
    /// `pending_items` and their job ids in `current_tasks`.
    pub fn snapshot(&self) -> CheckpointState {
        let mut inner = self.inner.lock();
        inner.state.touch();

        let in_flight_items: usize = inner.in_flight.values().map(|f| f.items.len()).sum();
        let mut pending = std::collections::VecDeque::with_capacity(
            in_flight_items + inner.state.pending_items.len(),
        );
        let mut current_tasks = Vec::new();
        for flight in inner.in_flight.values() {
            pending.extend(flight.items.iter().cloned());
            if let Some(job) = &flight.job_id {
                current_tasks.push(job.clone());
            }
        }
        pending.extend(inner.state.pending_items.iter().cloned());

        let state = &inner.state;
        CheckpointState {
            checkpoint_id: state.checkpoint_id.clone(),
            phase: state.phase,
            task_info: state.task_info.clone(),
            options: state.options.clone(),
            pending_items: pending,
            completed_items: state.completed_items.clone(),
            failed_items: state.failed_items.clone(),
            current_tasks,
            stats: state.stats,
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{TaskInfo, TransferOptions};

    fn state_with(pending: &[(&str, u64)]) -> CheckpointState {
        let now = Utc::now();
        let mut state = CheckpointState::new(
            TaskInfo {
                source_endpoint: "src".into(),
                source_path: "/src".into(),
                destination_endpoint: "dst".into(),
                destination_path: "/dst".into(),
                label: None,
                created_at: now,
                updated_at: now,
            },
            TransferOptions::default(),
        );
        for (name, size) in pending {
            state.pending_items.push_back(TransferItem::new(
                format!("/src/{name}"),
                format!("/dst/{name}"),
                *size,
            ));
        }
        state
    }

    #[test]
    fn reserved_items_stay_pending_in_snapshots() {
        let ledger = Ledger::new(state_with(&[("a", 1), ("b", 2), ("c", 3)]));
        let batch = ledger.reserve_batch(2).unwrap();
        ledger.attach_job(batch.id, "job-1");

        let snap = ledger.snapshot();
        assert_eq!(snap.pending_items.len(), 3);
        assert_eq!(snap.pending_items[0].source_path, "/src/a");
        assert_eq!(snap.current_tasks, vec!["job-1".to_string()]);
        assert!(snap.is_consistent());
        assert_eq!(ledger.queued_len(), 1);
    }

    #[test]
    fn complete_and_fail_keep_stats_balanced() {
        let ledger = Ledger::new(state_with(&[("a", 1), ("b", 2), ("c", 3)]));
        let first = ledger.reserve_batch(2).unwrap();
        let second = ledger.reserve_batch(2).unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(ledger.reserve_batch(2).is_none());

        assert_eq!(ledger.complete_batch(first.id), 2);
        assert_eq!(ledger.fail_batch(second.id, "denied"), 1);
        assert_eq!(ledger.complete_batch(first.id), 0);

        let snap = ledger.snapshot();
        assert!(snap.is_consistent());
        assert_eq!(snap.stats.completed_items, 2);
        assert_eq!(snap.stats.completed_bytes, 3);
        assert_eq!(snap.stats.failed_items, 1);
        assert_eq!(snap.failed_items[0].error, "denied");
        assert!(snap.pending_items.is_empty());
        assert!(!ledger.has_work());
    }

    #[test]
    fn released_batch_returns_to_front_in_order() {
        let ledger = Ledger::new(state_with(&[("a", 1), ("b", 2), ("c", 3)]));
        let batch = ledger.reserve_batch(2).unwrap();
        ledger.release_batch(batch.id);

        let again = ledger.reserve_batch(3).unwrap();
        let names: Vec<_> = again.items.iter().map(|i| i.source_path.as_str()).collect();
        assert_eq!(names, ["/src/a", "/src/b", "/src/c"]);
    }

    #[test]
    fn requeue_respects_retry_budget() {
        let ledger = Ledger::new(state_with(&[("a", 1)]));
        let max_retries = 2;

        for expected_retry in 1..=max_retries {
            let batch = ledger.reserve_batch(10).unwrap();
            ledger.fail_batch(batch.id, "boom");
            assert_eq!(ledger.requeue_failures(max_retries), 1);
            let snap = ledger.snapshot();
            assert_eq!(snap.pending_items[0].retry_count, expected_retry);
            assert!(snap.is_consistent());
        }

        let batch = ledger.reserve_batch(10).unwrap();
        ledger.fail_batch(batch.id, "boom");
        assert_eq!(ledger.requeue_failures(max_retries), 0);
        assert_eq!(ledger.failed_len(), 1);
        assert_eq!(ledger.snapshot().failed_items[0].retry_count, max_retries);
    }

    #[test]
    fn stale_tasks_are_dropped_on_load() {
        let mut state = state_with(&[("a", 1)]);
        state.current_tasks.push("job-from-crash".into());
        let ledger = Ledger::new(state);
        assert!(ledger.snapshot().current_tasks.is_empty());
    }
}
