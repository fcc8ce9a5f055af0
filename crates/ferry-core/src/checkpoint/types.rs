use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::{bail, Result};
use serde::{Deserialize, Serialize};

/// Controls when a file that already exists at the destination is sent again.
/// Each level re-transfers in every case the previous level does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SyncPolicy {
    /// Never overwrite an existing destination file.
    Exists = 0,
    /// Overwrite when the sizes differ.
    Size = 1,
    /// Overwrite when size or modification time differ.
    #[default]
    Mtime = 2,
    /// Overwrite when size, modification time or checksum differ.
    Checksum = 3,
}

impl From<SyncPolicy> for u8 {
    fn from(policy: SyncPolicy) -> Self {
        policy as u8
    }
}

impl TryFrom<u8> for SyncPolicy {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncPolicy::Exists),
            1 => Ok(SyncPolicy::Size),
            2 => Ok(SyncPolicy::Mtime),
            3 => Ok(SyncPolicy::Checksum),
            other => Err(format!("sync policy must be 0-3 (got {other})")),
        }
    }
}

/// What the backend knows about one side of a path pair.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileFacts {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
}

impl SyncPolicy {
    /// Decide whether `source` must be sent given what exists at the destination.
    pub fn should_transfer(self, source: &FileFacts, destination: Option<&FileFacts>) -> bool {
        let Some(dest) = destination else {
            return true;
        };

        if self >= SyncPolicy::Size && source.size != dest.size {
            return true;
        }
        if self >= SyncPolicy::Mtime && source.modified != dest.modified {
            return true;
        }
        // Unknown checksums on either side never force a transfer.
        if self >= SyncPolicy::Checksum {
            if let (Some(a), Some(b)) = (&source.checksum, &dest.checksum) {
                return a != b;
            }
        }
        false
    }
}

/// One source/destination path pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub source_path: String,
    pub destination_path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// How many times this item has been re-queued after a failed job.
    #[serde(default)]
    pub retry_count: u32,
}

impl TransferItem {
    pub fn new(source_path: impl Into<String>, destination_path: impl Into<String>, size: u64) -> Self {
        Self {
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            size,
            checksum: None,
            retry_count: 0,
        }
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    /// Copy of this item with the retry counter bumped, used when re-queueing.
    pub fn with_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }
}

/// An item whose last job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: TransferItem,
    pub error: String,
    pub retry_count: u32,
    pub last_attempt: DateTime<Utc>,
}

impl FailedItem {
    pub fn new(item: TransferItem, error: impl Into<String>) -> Self {
        Self {
            retry_count: item.retry_count,
            item,
            error: error.into(),
            last_attempt: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub source_endpoint: String,
    pub source_path: String,
    pub destination_endpoint: String,
    pub destination_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-transfer tuning persisted with the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Maximum items per backend job.
    pub batch_size: usize,
    /// How many times a failed item is re-queued before it stays failed.
    pub max_retries: u32,
    /// Interval between periodic checkpoint saves.
    pub checkpoint_interval_ms: u64,
    /// Batches submitted and polled at the same time.
    pub max_concurrent_tasks: usize,
    pub poll_interval_ms: u64,
    /// Deadline for a single job to reach a terminal state.
    pub poll_timeout_ms: u64,
    pub sync_policy: SyncPolicy,
    pub verify_checksum: bool,
    pub preserve_mtime: bool,
    pub encrypt: bool,
    pub recursive: bool,
    /// Deepest directory listed, root is depth 0. `None` walks everything.
    pub max_depth: Option<usize>,
    /// Skip entries whose name starts with a dot.
    pub skip_hidden: bool,
    pub enumeration_workers: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            checkpoint_interval_ms: 30_000,
            max_concurrent_tasks: 4,
            poll_interval_ms: 2_000,
            poll_timeout_ms: 60 * 60 * 1000,
            sync_policy: SyncPolicy::default(),
            verify_checksum: true,
            preserve_mtime: true,
            encrypt: false,
            recursive: true,
            max_depth: None,
            skip_hidden: false,
            enumeration_workers: num_cpus::get().clamp(1, 8),
        }
    }
}

impl TransferOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.max_concurrent_tasks == 0 {
            bail!("max_concurrent_tasks must be at least 1");
        }
        if self.enumeration_workers == 0 {
            bail!("enumeration_workers must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.checkpoint_interval_ms == 0 {
            bail!("checkpoint_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferStats {
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub remaining_items: u64,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub failed_bytes: u64,
    pub remaining_bytes: u64,
}

impl TransferStats {
    /// Counters derived from scratch from the three buckets.
    pub fn from_buckets<'a>(
        pending: impl IntoIterator<Item = &'a TransferItem>,
        completed: impl IntoIterator<Item = &'a TransferItem>,
        failed: impl IntoIterator<Item = &'a FailedItem>,
    ) -> Self {
        let mut stats = TransferStats::default();
        for item in pending {
            stats.remaining_items += 1;
            stats.remaining_bytes += item.size;
        }
        for item in completed {
            stats.completed_items += 1;
            stats.completed_bytes += item.size;
        }
        for failed in failed {
            stats.failed_items += 1;
            stats.failed_bytes += failed.item.size;
        }
        stats.total_items = stats.remaining_items + stats.completed_items + stats.failed_items;
        stats.total_bytes = stats.remaining_bytes + stats.completed_bytes + stats.failed_bytes;
        stats
    }

    pub fn is_consistent(&self) -> bool {
        self.total_items == self.completed_items + self.failed_items + self.remaining_items
            && self.total_bytes == self.completed_bytes + self.failed_bytes + self.remaining_bytes
    }

    pub(crate) fn move_remaining_to_completed(&mut self, items: u64, bytes: u64) {
        self.remaining_items -= items;
        self.remaining_bytes -= bytes;
        self.completed_items += items;
        self.completed_bytes += bytes;
    }

    pub(crate) fn move_remaining_to_failed(&mut self, items: u64, bytes: u64) {
        self.remaining_items -= items;
        self.remaining_bytes -= bytes;
        self.failed_items += items;
        self.failed_bytes += bytes;
    }

    pub(crate) fn move_failed_to_remaining(&mut self, items: u64, bytes: u64) {
        self.failed_items -= items;
        self.failed_bytes -= bytes;
        self.remaining_items += items;
        self.remaining_bytes += bytes;
    }
}

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Planning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Failed | TransferPhase::Cancelled
        )
    }
}

/// Durable progress of one transfer, written as one JSON record per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub checkpoint_id: String,
    pub phase: TransferPhase,
    pub task_info: TaskInfo,
    pub options: TransferOptions,
    pub pending_items: VecDeque<TransferItem>,
    pub completed_items: Vec<TransferItem>,
    pub failed_items: Vec<FailedItem>,
    pub current_tasks: Vec<String>,
    pub stats: TransferStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CheckpointState {
    /// Fresh state in the planning phase with a newly generated id.
    pub fn new(task_info: TaskInfo, options: TransferOptions) -> Self {
        Self {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            phase: TransferPhase::Planning,
            task_info,
            options,
            pending_items: VecDeque::new(),
            completed_items: Vec::new(),
            failed_items: Vec::new(),
            current_tasks: Vec::new(),
            stats: TransferStats::default(),
            last_error: None,
        }
    }

    pub fn recompute_stats(&mut self) {
        self.stats = TransferStats::from_buckets(
            &self.pending_items,
            &self.completed_items,
            &self.failed_items,
        );
    }

    pub fn touch(&mut self) {
        self.task_info.updated_at = Utc::now();
    }

    /// Cached stats agree with the buckets.
    pub fn is_consistent(&self) -> bool {
        self.stats.is_consistent()
            && self.stats
                == TransferStats::from_buckets(
                    &self.pending_items,
                    &self.completed_items,
                    &self.failed_items,
                )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(size: u64, secs: i64, sum: Option<&str>) -> FileFacts {
        FileFacts {
            size,
            modified: DateTime::from_timestamp(secs, 0),
            checksum: sum.map(str::to_string),
        }
    }

    #[test]
    fn sync_policies_are_monotonic() {
        let src = facts(10, 100, Some("aa"));
        let same = facts(10, 100, Some("aa"));
        let other_sum = facts(10, 100, Some("bb"));
        let other_time = facts(10, 200, Some("aa"));
        let other_size = facts(11, 100, Some("aa"));

        for policy in [SyncPolicy::Exists, SyncPolicy::Size, SyncPolicy::Mtime, SyncPolicy::Checksum] {
            assert!(policy.should_transfer(&src, None));
            assert!(!policy.should_transfer(&src, Some(&same)));
        }

        assert!(!SyncPolicy::Exists.should_transfer(&src, Some(&other_size)));
        assert!(SyncPolicy::Size.should_transfer(&src, Some(&other_size)));
        assert!(!SyncPolicy::Size.should_transfer(&src, Some(&other_time)));
        assert!(SyncPolicy::Mtime.should_transfer(&src, Some(&other_time)));
        assert!(!SyncPolicy::Mtime.should_transfer(&src, Some(&other_sum)));
        assert!(SyncPolicy::Checksum.should_transfer(&src, Some(&other_sum)));
    }

    #[test]
    fn sync_policy_serializes_as_ordinal() {
        assert_eq!(serde_json::to_string(&SyncPolicy::Size).unwrap(), "1");
        let parsed: SyncPolicy = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, SyncPolicy::Checksum);
        assert!(serde_json::from_str::<SyncPolicy>("4").is_err());
    }

    #[test]
    fn with_retry_leaves_source_item_untouched() {
        let item = TransferItem::new("/src/a", "/dst/a", 5);
        let retried = item.with_retry();
        assert_eq!(item.retry_count, 0);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.source_path, item.source_path);
    }

    #[test]
    fn stats_from_buckets_balance() {
        let pending = vec![TransferItem::new("/a", "/b", 3)];
        let completed = vec![TransferItem::new("/c", "/d", 4), TransferItem::new("/e", "/f", 5)];
        let failed = vec![FailedItem::new(TransferItem::new("/g", "/h", 6), "boom")];

        let stats = TransferStats::from_buckets(&pending, &completed, &failed);
        assert_eq!(stats.total_items, 4);
        assert_eq!(stats.total_bytes, 18);
        assert_eq!(stats.failed_bytes, 6);
        assert!(stats.is_consistent());
    }

    #[test]
    fn options_validation() {
        assert!(TransferOptions::default().validate().is_ok());
        let opts = TransferOptions {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
