//! Interface to the external bulk-transfer service.
//!
//! The engine never moves bytes. It lists the source tree, hands batches of
//! path pairs to the service as asynchronous jobs and polls them until they
//! finish. Everything on the far side of [`TransferBackend`] is a black box.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{SyncPolicy, TransferItem, TransferOptions};
use crate::errors::BackendError;

pub use memory::MemoryBackend;

/// Describes the kind of entry returned by a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ListingEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
            modified: None,
            checksum: None,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
            checksum: None,
        }
    }
}

/// One page of a listing; `next_page_token` is set while more pages remain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ListingEntry>,
    pub next_page_token: Option<String>,
}

/// Everything the service needs to run one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchJobRequest {
    pub source_endpoint: String,
    pub destination_endpoint: String,
    pub items: Vec<TransferItem>,
    pub sync_policy: SyncPolicy,
    pub verify_checksum: bool,
    pub preserve_mtime: bool,
    pub encrypt: bool,
    pub label: Option<String>,
}

impl BatchJobRequest {
    pub fn new(
        source_endpoint: &str,
        destination_endpoint: &str,
        items: Vec<TransferItem>,
        options: &TransferOptions,
        label: Option<String>,
    ) -> Self {
        Self {
            source_endpoint: source_endpoint.to_string(),
            destination_endpoint: destination_endpoint.to_string(),
            items,
            sync_policy: options.sync_policy,
            verify_checksum: options.verify_checksum,
            preserve_mtime: options.preserve_mtime,
            encrypt: options.encrypt,
            label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Active,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    /// Service-provided detail, usually set for failed jobs.
    pub message: Option<String>,
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// List one page of `path` on `endpoint`. Pass the previous page's token to continue.
    async fn list_directory(
        &self,
        endpoint: &str,
        path: &str,
        page_token: Option<&str>,
    ) -> Result<ListPage, BackendError>;

    /// Start an asynchronous job for the batch and return its id.
    async fn submit_batch_job(&self, request: &BatchJobRequest) -> Result<String, BackendError>;

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, BackendError>;
}

/// Join a listing name onto a slash separated endpoint path.
pub fn join_path(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        return format!("/{name}");
    }
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Split an endpoint path into parent and final component.
pub(crate) fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_slashes() {
        assert_eq!(join_path("/src", "a.txt"), "/src/a.txt");
        assert_eq!(join_path("/src/", "a.txt"), "/src/a.txt");
        assert_eq!(join_path("/", "a.txt"), "/a.txt");
        assert_eq!(join_path("", "a.txt"), "/a.txt");
    }

    #[test]
    fn split_returns_parent_and_name() {
        assert_eq!(split_path("/src/sub/c.txt"), ("/src/sub".into(), "c.txt".into()));
        assert_eq!(split_path("/src"), ("/".into(), "src".into()));
        assert_eq!(split_path("/src/sub/"), ("/src".into(), "sub".into()));
    }

    #[test]
    fn job_state_wire_names() {
        assert_eq!(serde_json::to_string(&JobState::Succeeded).unwrap(), "\"SUCCEEDED\"");
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }
}
