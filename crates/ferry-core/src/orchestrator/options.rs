use std::time::Duration;

use chrono::Utc;

use crate::checkpoint::{TaskInfo, TransferOptions};

/// What to copy, from where to where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub source_endpoint: String,
    pub source_path: String,
    pub destination_endpoint: String,
    pub destination_path: String,
    pub label: Option<String>,
}

impl TransferRequest {
    pub fn new(
        source_endpoint: impl Into<String>,
        source_path: impl Into<String>,
        destination_endpoint: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Self {
        Self {
            source_endpoint: source_endpoint.into(),
            source_path: source_path.into(),
            destination_endpoint: destination_endpoint.into(),
            destination_path: destination_path.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub(crate) fn task_info(&self) -> TaskInfo {
        let now = Utc::now();
        TaskInfo {
            source_endpoint: self.source_endpoint.clone(),
            source_path: self.source_path.clone(),
            destination_endpoint: self.destination_endpoint.clone(),
            destination_path: self.destination_path.clone(),
            label: self.label.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Overrides applied to the saved options when a transfer is resumed.
/// Unset fields keep the value stored in the checkpoint.
#[derive(Clone, Debug, Default)]
pub struct ResumeOptions {
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub max_concurrent_tasks: Option<usize>,
    pub checkpoint_interval: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub poll_timeout: Option<Duration>,
    /// Stop scheduling after this long. Progress is saved and the transfer
    /// stays resumable.
    pub deadline: Option<Duration>,
}

impl ResumeOptions {
    pub(crate) fn apply(&self, options: &mut TransferOptions) {
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        if let Some(max_retries) = self.max_retries {
            options.max_retries = max_retries;
        }
        if let Some(max_concurrent) = self.max_concurrent_tasks {
            options.max_concurrent_tasks = max_concurrent;
        }
        if let Some(interval) = self.checkpoint_interval {
            options.checkpoint_interval_ms = duration_ms(interval);
        }
        if let Some(interval) = self.poll_interval {
            options.poll_interval_ms = duration_ms(interval);
        }
        if let Some(timeout) = self.poll_timeout {
            options.poll_timeout_ms = duration_ms(timeout);
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_only_touch_set_fields() {
        let mut options = TransferOptions::default();
        let before = options.clone();
        ResumeOptions {
            max_retries: Some(9),
            poll_interval: Some(Duration::from_millis(15)),
            ..Default::default()
        }
        .apply(&mut options);

        assert_eq!(options.max_retries, 9);
        assert_eq!(options.poll_interval_ms, 15);
        assert_eq!(options.batch_size, before.batch_size);
        assert_eq!(options.checkpoint_interval_ms, before.checkpoint_interval_ms);
    }
}
