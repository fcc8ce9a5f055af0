//! Groups enumerated files into bounded batches.

use eyre::{Result, WrapErr};

use crate::backend::join_path;
use crate::checkpoint::TransferItem;
use crate::enumeration::StreamingEnumerator;

/// Files destined for one backend job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub items: Vec<TransferItem>,
    pub total_bytes: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Running totals over everything the planner has consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanTotals {
    pub entries_seen: u64,
    pub directories_skipped: u64,
    pub files: u64,
    pub bytes: u64,
    pub batches: u64,
}

pub struct BatchPlanner {
    enumerator: StreamingEnumerator,
    source_root: String,
    destination_root: String,
    batch_size: usize,
    totals: PlanTotals,
    exhausted: bool,
}

impl BatchPlanner {
    pub fn new(
        enumerator: StreamingEnumerator,
        source_root: impl Into<String>,
        destination_root: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            enumerator,
            source_root: source_root.into(),
            destination_root: destination_root.into(),
            batch_size: batch_size.max(1),
            totals: PlanTotals::default(),
            exhausted: false,
        }
    }

    /// Next full batch, the final partial batch, or `None` when the tree is done.
    ///
    /// A listing failure is returned as an error and any partially filled
    /// batch is discarded.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut batch = Batch {
            items: Vec::with_capacity(self.batch_size),
            total_bytes: 0,
        };

        while batch.items.len() < self.batch_size {
            let Some(entry) = self.enumerator.next().await else {
                self.exhausted = true;
                if let Some(err) = self.enumerator.take_error() {
                    return Err(err).wrap_err_with(|| {
                        format!(
                            "enumeration of {}:{} failed",
                            self.enumerator.endpoint(),
                            self.source_root
                        )
                    });
                }
                break;
            };

            self.totals.entries_seen += 1;
            if entry.is_dir() {
                self.totals.directories_skipped += 1;
                continue;
            }

            let destination =
                resolve_destination(&self.source_root, &self.destination_root, &entry.path);
            batch.total_bytes += entry.size;
            batch.items.push(
                TransferItem::new(entry.path, destination, entry.size).with_checksum(entry.checksum),
            );
        }

        if batch.is_empty() {
            return Ok(None);
        }

        self.totals.files += batch.len() as u64;
        self.totals.bytes += batch.total_bytes;
        self.totals.batches += 1;
        log::trace!(
            "planned batch {} with {} file(s), {} bytes",
            self.totals.batches,
            batch.len(),
            batch.total_bytes
        );
        Ok(Some(batch))
    }

    pub fn totals(&self) -> PlanTotals {
        self.totals
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Stop the underlying enumeration.
    pub fn close(&mut self) {
        self.enumerator.close();
        self.exhausted = true;
    }
}

/// Map a source path under `source_root` onto `destination_root`.
/// Paths outside the source root keep their full path below the destination.
pub fn resolve_destination(source_root: &str, destination_root: &str, source_path: &str) -> String {
    let root = source_root.trim_end_matches('/');
    let relative = match source_path.strip_prefix(root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || root.is_empty() => rest,
        _ => source_path,
    };
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return destination_root.to_string();
    }
    join_path(destination_root, relative)
}
