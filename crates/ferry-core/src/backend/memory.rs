//! In-process [`TransferBackend`] with scripted trees and job outcomes.
//!
//! Endpoints hold directory listings keyed by path. Jobs stay `ACTIVE` for a
//! configurable number of polls, then succeed (copying entries into the
//! destination endpoint according to the sync policy) or fail when one of their
//! source paths has been marked as failing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    split_path, BatchJobRequest, EntryKind, JobState, JobStatus, ListPage,
    ListingEntry, TransferBackend,
};
use crate::checkpoint::FileFacts;
use crate::errors::BackendError;

/// Number of calls made against each remote operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: u64,
    pub submit: u64,
    pub status: u64,
}

impl CallCounts {
    pub fn total(&self) -> u64 {
        self.list + self.submit + self.status
    }
}

type DirKey = (String, String);

#[derive(Debug)]
struct MemoryJob {
    request: BatchJobRequest,
    polls_left: u32,
    outcome: JobState,
    message: Option<String>,
    applied: bool,
    files_transferred: u64,
    bytes_transferred: u64,
}

#[derive(Debug)]
struct MemoryInner {
    dirs: HashMap<DirKey, Vec<ListingEntry>>,
    page_size: usize,
    list_delay: Option<Duration>,
    polls_until_done: u32,
    failing_listings: HashSet<DirKey>,
    // source path -> number of jobs still to fail
    failing_sources: HashMap<String, u32>,
    submit_failures: VecDeque<BackendError>,
    status_failures: VecDeque<BackendError>,
    jobs: HashMap<String, MemoryJob>,
    submitted: Vec<BatchJobRequest>,
    calls: CallCounts,
    next_job: u64,
}

#[derive(Debug)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                dirs: HashMap::new(),
                page_size: 1000,
                list_delay: None,
                polls_until_done: 0,
                failing_listings: HashSet::new(),
                failing_sources: HashMap::new(),
                submit_failures: VecDeque::new(),
                status_failures: VecDeque::new(),
                jobs: HashMap::new(),
                submitted: Vec::new(),
                calls: CallCounts::default(),
                next_job: 1,
            }),
        }
    }

    /// Entries returned per listing page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.inner.lock().page_size = page_size.max(1);
        self
    }

    /// Every listing call sleeps for `delay` before answering.
    pub fn with_list_delay(self, delay: Duration) -> Self {
        self.inner.lock().list_delay = Some(delay);
        self
    }

    /// How many status polls report `ACTIVE` before a job finishes.
    pub fn with_polls_until_done(self, polls: u32) -> Self {
        self.inner.lock().polls_until_done = polls;
        self
    }

    /// Create `path` (and any missing parents) as a directory on `endpoint`.
    pub fn add_dir(&self, endpoint: &str, path: &str) {
        self.inner.lock().ensure_dir(endpoint, path);
    }

    pub fn add_file(&self, endpoint: &str, path: &str, size: u64) {
        let (_, name) = split_path(path);
        self.add_entry(endpoint, path, ListingEntry::file(name, size));
    }

    /// Place `entry` at `path`, replacing an existing entry of the same name.
    pub fn add_entry(&self, endpoint: &str, path: &str, entry: ListingEntry) {
        let mut inner = self.inner.lock();
        let (parent, _) = split_path(path);
        inner.ensure_dir(endpoint, &parent);
        if entry.kind == EntryKind::Directory {
            inner.ensure_dir(endpoint, path);
        } else {
            inner.upsert(endpoint, &parent, entry);
        }
    }

    /// Listing `path` fails with a non-retryable error.
    pub fn fail_listing(&self, endpoint: &str, path: &str) {
        self.inner
            .lock()
            .failing_listings
            .insert((endpoint.to_string(), path.to_string()));
    }

    /// Every job containing `source_path` fails.
    pub fn fail_jobs_with(&self, source_path: &str) {
        self.fail_jobs_with_times(source_path, u32::MAX);
    }

    /// The next `times` jobs containing `source_path` fail.
    pub fn fail_jobs_with_times(&self, source_path: &str, times: u32) {
        self.inner
            .lock()
            .failing_sources
            .insert(source_path.to_string(), times);
    }

    /// Queue an error for the next submission.
    pub fn push_submit_error(&self, err: BackendError) {
        self.inner.lock().submit_failures.push_back(err);
    }

    /// Queue an error for the next status poll.
    pub fn push_status_error(&self, err: BackendError) {
        self.inner.lock().status_failures.push_back(err);
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.lock().calls
    }

    pub fn submitted(&self) -> Vec<BatchJobRequest> {
        self.inner.lock().submitted.clone()
    }

    /// Source paths of every submitted item, in submission order.
    pub fn submitted_sources(&self) -> Vec<String> {
        self.inner
            .lock()
            .submitted
            .iter()
            .flat_map(|req| req.items.iter().map(|item| item.source_path.clone()))
            .collect()
    }

    /// Entry stored at `path` on `endpoint`, if any.
    pub fn entry(&self, endpoint: &str, path: &str) -> Option<ListingEntry> {
        self.inner.lock().lookup(endpoint, path).cloned()
    }
}

impl MemoryInner {
    fn ensure_dir(&mut self, endpoint: &str, path: &str) {
        let key = (endpoint.to_string(), path.to_string());
        if self.dirs.contains_key(&key) {
            return;
        }
        self.dirs.insert(key, Vec::new());
        if path != "/" && !path.is_empty() {
            let (parent, name) = split_path(path);
            self.ensure_dir(endpoint, &parent);
            self.upsert(endpoint, &parent, ListingEntry::directory(name));
        }
    }

    fn upsert(&mut self, endpoint: &str, dir: &str, entry: ListingEntry) {
        let listing = self
            .dirs
            .entry((endpoint.to_string(), dir.to_string()))
            .or_default();
        match listing.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => listing.push(entry),
        }
    }

    fn lookup(&self, endpoint: &str, path: &str) -> Option<&ListingEntry> {
        let (parent, name) = split_path(path);
        self.dirs
            .get(&(endpoint.to_string(), parent))?
            .iter()
            .find(|e| e.name == name)
    }

    fn apply_job(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let request = job.request.clone();

        let mut files = 0u64;
        let mut bytes = 0u64;
        for item in &request.items {
            let source = self.lookup(&request.source_endpoint, &item.source_path);
            let source_facts = FileFacts {
                size: item.size,
                modified: source.and_then(|e| e.modified),
                checksum: item
                    .checksum
                    .clone()
                    .or_else(|| source.and_then(|e| e.checksum.clone())),
            };
            let dest_facts = self
                .lookup(&request.destination_endpoint, &item.destination_path)
                .map(|e| FileFacts {
                    size: e.size,
                    modified: e.modified,
                    checksum: e.checksum.clone(),
                });

            if !request
                .sync_policy
                .should_transfer(&source_facts, dest_facts.as_ref())
            {
                continue;
            }

            let (parent, name) = split_path(&item.destination_path);
            self.ensure_dir(&request.destination_endpoint, &parent);
            self.upsert(
                &request.destination_endpoint,
                &parent,
                ListingEntry {
                    name,
                    kind: EntryKind::File,
                    size: source_facts.size,
                    modified: if request.preserve_mtime {
                        source_facts.modified
                    } else {
                        None
                    },
                    checksum: source_facts.checksum,
                },
            );
            files += 1;
            bytes += item.size;
        }

        if let Some(job) = self.jobs.get_mut(job_id) {
            job.applied = true;
            job.files_transferred = files;
            job.bytes_transferred = bytes;
        }
    }
}

#[async_trait]
impl TransferBackend for MemoryBackend {
    async fn list_directory(
        &self,
        endpoint: &str,
        path: &str,
        page_token: Option<&str>,
    ) -> Result<ListPage, BackendError> {
        let delay = self.inner.lock().list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock();
        inner.calls.list += 1;

        let key = (endpoint.to_string(), path.to_string());
        if inner.failing_listings.contains(&key) {
            return Err(BackendError::from_status(
                403,
                format!("permission denied listing {endpoint}:{path}"),
            ));
        }
        let Some(listing) = inner.dirs.get(&key) else {
            return Err(BackendError::from_status(
                404,
                format!("no such directory {endpoint}:{path}"),
            ));
        };

        let offset = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| BackendError::from_status(400, format!("bad page token {token}")))?,
        };
        let end = (offset + inner.page_size).min(listing.len());
        let entries = listing.get(offset..end).unwrap_or_default().to_vec();
        let next_page_token = (end < listing.len()).then(|| end.to_string());

        Ok(ListPage {
            entries,
            next_page_token,
        })
    }

    async fn submit_batch_job(&self, request: &BatchJobRequest) -> Result<String, BackendError> {
        let mut inner = self.inner.lock();
        inner.calls.submit += 1;
        if let Some(err) = inner.submit_failures.pop_front() {
            return Err(err);
        }

        let mut failing = None;
        for item in &request.items {
            if let Some(remaining) = inner.failing_sources.get_mut(&item.source_path) {
                if *remaining > 0 {
                    *remaining = remaining.saturating_sub(1);
                    failing.get_or_insert_with(|| item.source_path.clone());
                }
            }
        }

        let job_id = format!("job-{:04}", inner.next_job);
        inner.next_job += 1;
        let (outcome, message) = match failing {
            Some(path) => (JobState::Failed, Some(format!("failed to transfer {path}"))),
            None => (JobState::Succeeded, None),
        };
        let polls_left = inner.polls_until_done;
        inner.jobs.insert(
            job_id.clone(),
            MemoryJob {
                request: request.clone(),
                polls_left,
                outcome,
                message,
                applied: false,
                files_transferred: 0,
                bytes_transferred: 0,
            },
        );
        inner.submitted.push(request.clone());
        Ok(job_id)
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        let mut inner = self.inner.lock();
        inner.calls.status += 1;
        if let Some(err) = inner.status_failures.pop_front() {
            return Err(err);
        }

        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Err(BackendError::from_status(404, format!("unknown job {job_id}")));
        };

        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(JobStatus {
                job_id: job_id.to_string(),
                state: JobState::Active,
                bytes_transferred: 0,
                files_transferred: 0,
                message: None,
            });
        }

        let needs_apply = job.outcome == JobState::Succeeded && !job.applied;
        if needs_apply {
            inner.apply_job(job_id);
        }

        let job = &inner.jobs[job_id];
        Ok(JobStatus {
            job_id: job_id.to_string(),
            state: job.outcome,
            bytes_transferred: job.bytes_transferred,
            files_transferred: job.files_transferred,
            message: job.message.clone(),
        })
    }
}
