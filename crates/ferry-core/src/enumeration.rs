use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::backend::{join_path, TransferBackend};
use crate::checkpoint::TransferOptions;
use crate::errors::BackendError;
use crate::retry::{retry_with_backoff, RetryPolicy};

pub use crate::backend::EntryKind;

/// One entry discovered under the enumeration root. `path` is the full
/// endpoint path; `depth` is 1 for direct children of the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedEntry {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub depth: usize,
}

impl EnumeratedEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

#[derive(Debug, Clone)]
pub struct EnumeratorOptions {
    /// Concurrent listing workers.
    pub workers: usize,
    pub recursive: bool,
    /// Deepest directory listed (root = 0).
    pub max_depth: Option<usize>,
    pub skip_hidden: bool,
    /// Entries buffered between the workers and `next()`.
    pub channel_capacity: usize,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, 8),
            recursive: true,
            max_depth: None,
            skip_hidden: false,
            channel_capacity: 1024,
        }
    }
}

impl From<&TransferOptions> for EnumeratorOptions {
    fn from(options: &TransferOptions) -> Self {
        Self {
            workers: options.enumeration_workers.max(1),
            recursive: options.recursive,
            max_depth: options.max_depth,
            skip_hidden: options.skip_hidden,
            ..Self::default()
        }
    }
}

struct DirJob {
    path: String,
    depth: usize,
}

/// Directories waiting to be listed. The queue is not capped: it holds one
/// job per discovered directory, and `visited` keeps each directory to a
/// single job. Workers blocked on the output channel stop adding to it.
#[derive(Default)]
struct Frontier {
    queue: VecDeque<DirJob>,
    active: usize,
    visited: HashSet<String>,
}

struct WalkShared {
    frontier: Mutex<Frontier>,
    notify: Notify,
    cancelled: AtomicBool,
    error: Mutex<Option<eyre::Report>>,
    directories_listed: AtomicU64,
}

impl WalkShared {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn fail(&self, err: eyre::Report) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancel();
    }
}

struct WalkContext {
    backend: Arc<dyn TransferBackend>,
    endpoint: String,
    options: EnumeratorOptions,
    retry: RetryPolicy,
}

struct ActiveWalk {
    rx: mpsc::Receiver<EnumeratedEntry>,
    shared: Arc<WalkShared>,
}

impl Drop for ActiveWalk {
    fn drop(&mut self) {
        // Workers finish their current call and exit; nothing is aborted.
        self.shared.cancel();
    }
}

/// Lazily walks a remote tree with a fixed pool of listing workers.
///
/// Entries from different directories interleave in no particular order.
/// Memory is bounded by the output channel plus the directory frontier.
pub struct StreamingEnumerator {
    ctx: Arc<WalkContext>,
    root: String,
    walk: Option<ActiveWalk>,
    error: Option<eyre::Report>,
    finished: bool,
    emitted: u64,
    directories_listed: u64,
}

impl StreamingEnumerator {
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        endpoint: impl Into<String>,
        root: impl Into<String>,
        options: EnumeratorOptions,
    ) -> Self {
        Self {
            ctx: Arc::new(WalkContext {
                backend,
                endpoint: endpoint.into(),
                options,
                retry: RetryPolicy::default(),
            }),
            root: root.into(),
            walk: None,
            error: None,
            finished: false,
            emitted: 0,
            directories_listed: 0,
        }
    }

    /// Retry policy for listing calls. Takes effect on the next (re)start.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        let ctx = WalkContext {
            backend: Arc::clone(&self.ctx.backend),
            endpoint: self.ctx.endpoint.clone(),
            options: self.ctx.options.clone(),
            retry,
        };
        self.ctx = Arc::new(ctx);
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn endpoint(&self) -> &str {
        &self.ctx.endpoint
    }

    /// Next entry, or `None` once the tree is exhausted, closed or failed.
    /// Check [`error`](Self::error) after `None`.
    pub async fn next(&mut self) -> Option<EnumeratedEntry> {
        if self.finished {
            return None;
        }
        if self.walk.is_none() {
            self.walk = Some(self.start());
        }

        let walk = self.walk.as_mut()?;
        let received = walk.rx.recv().await;
        match received {
            Some(entry) => {
                self.emitted += 1;
                Some(entry)
            }
            None => {
                self.finish();
                None
            }
        }
    }

    /// The listing failure that ended the sequence, if any.
    pub fn error(&self) -> Option<&eyre::Report> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<eyre::Report> {
        self.error.take()
    }

    /// Stop the walk. In-flight listing calls complete but their results are dropped.
    pub fn close(&mut self) {
        if let Some(walk) = self.walk.take() {
            walk.shared.cancel();
            self.directories_listed = walk.shared.directories_listed.load(Ordering::Relaxed);
        }
        self.finished = true;
    }

    /// Discard all progress; the next call to [`next`](Self::next) starts again from the root.
    pub fn reset(&mut self) {
        self.close();
        self.error = None;
        self.finished = false;
        self.emitted = 0;
        self.directories_listed = 0;
    }

    pub fn entries_emitted(&self) -> u64 {
        self.emitted
    }

    pub fn directories_listed(&self) -> u64 {
        match &self.walk {
            Some(walk) => walk.shared.directories_listed.load(Ordering::Relaxed),
            None => self.directories_listed,
        }
    }

    fn finish(&mut self) {
        if let Some(walk) = self.walk.take() {
            self.directories_listed = walk.shared.directories_listed.load(Ordering::Relaxed);
            if let Some(err) = walk.shared.error.lock().take() {
                self.error = Some(err);
            }
        }
        self.finished = true;
    }

    fn start(&self) -> ActiveWalk {
        let (tx, rx) = mpsc::channel(self.ctx.options.channel_capacity.max(1));
        let mut frontier = Frontier::default();
        frontier.visited.insert(self.root.clone());
        frontier.queue.push_back(DirJob {
            path: self.root.clone(),
            depth: 0,
        });

        let shared = Arc::new(WalkShared {
            frontier: Mutex::new(frontier),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
            directories_listed: AtomicU64::new(0),
        });

        for idx in 0..self.ctx.options.workers.max(1) {
            tokio::spawn(walk_worker(
                idx,
                Arc::clone(&self.ctx),
                Arc::clone(&shared),
                tx.clone(),
            ));
        }

        log::debug!(
            "enumeration of {}:{} started with {} worker(s)",
            self.ctx.endpoint,
            self.root,
            self.ctx.options.workers.max(1)
        );

        ActiveWalk { rx, shared }
    }
}

enum Step {
    List(DirJob),
    Wait,
    Done,
}

async fn walk_worker(
    idx: usize,
    ctx: Arc<WalkContext>,
    shared: Arc<WalkShared>,
    tx: mpsc::Sender<EnumeratedEntry>,
) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.is_cancelled() {
            break;
        }

        let step = {
            let mut frontier = shared.frontier.lock();
            match frontier.queue.pop_front() {
                Some(job) => {
                    frontier.active += 1;
                    Step::List(job)
                }
                None if frontier.active == 0 => Step::Done,
                None => Step::Wait,
            }
        };

        match step {
            Step::Done => {
                shared.notify.notify_waiters();
                break;
            }
            Step::Wait => notified.await,
            Step::List(job) => {
                let result = list_directory(&ctx, &shared, &job, &tx).await;
                shared.frontier.lock().active -= 1;
                shared.notify.notify_waiters();
                if let Err(err) = result {
                    log::warn!("enumeration worker {idx}: {err:#}");
                    shared.fail(err);
                    break;
                }
            }
        }
    }
    log::trace!("enumeration worker {idx} exiting");
}

async fn list_directory(
    ctx: &WalkContext,
    shared: &WalkShared,
    job: &DirJob,
    tx: &mpsc::Sender<EnumeratedEntry>,
) -> Result<()> {
    let mut token: Option<String> = None;
    loop {
        let backend = &ctx.backend;
        let endpoint = ctx.endpoint.as_str();
        let path = job.path.as_str();
        let page_token = token.as_deref();
        let page = retry_with_backoff(
            &ctx.retry,
            move || backend.list_directory(endpoint, path, page_token),
            BackendError::is_retryable,
        )
        .await
        .wrap_err_with(|| format!("failed to list {}:{}", ctx.endpoint, job.path))?;

        if shared.is_cancelled() {
            return Ok(());
        }

        let child_depth = job.depth + 1;
        for entry in page.entries {
            if ctx.options.skip_hidden && entry.name.starts_with('.') {
                continue;
            }
            let path = join_path(&job.path, &entry.name);

            if entry.kind == EntryKind::Directory
                && ctx.options.recursive
                && ctx.options.max_depth.map_or(true, |max| child_depth <= max)
            {
                let queued = {
                    let mut frontier = shared.frontier.lock();
                    if frontier.visited.insert(path.clone()) {
                        frontier.queue.push_back(DirJob {
                            path: path.clone(),
                            depth: child_depth,
                        });
                        true
                    } else {
                        false
                    }
                };
                if queued {
                    shared.notify.notify_waiters();
                }
            }

            let out = EnumeratedEntry {
                path,
                name: entry.name,
                kind: entry.kind,
                size: entry.size,
                modified: entry.modified,
                checksum: entry.checksum,
                depth: child_depth,
            };
            if tx.send(out).await.is_err() {
                // Consumer went away.
                shared.cancel();
                return Ok(());
            }
        }

        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    shared.directories_listed.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn sample_tree() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new().with_page_size(2);
        backend.add_file("ep", "/src/a.txt", 10);
        backend.add_file("ep", "/src/b.txt", 20);
        backend.add_file("ep", "/src/sub/c.txt", 30);
        backend.add_file("ep", "/src/sub/deeper/d.txt", 40);
        backend.add_file("ep", "/src/.hidden", 1);
        Arc::new(backend)
    }

    async fn collect(enumerator: &mut StreamingEnumerator) -> Vec<String> {
        let mut paths = Vec::new();
        while let Some(entry) = enumerator.next().await {
            paths.push(entry.path);
        }
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn walks_whole_tree_with_several_workers() {
        let backend = sample_tree();
        let options = EnumeratorOptions {
            workers: 4,
            ..Default::default()
        };
        let mut enumerator = StreamingEnumerator::new(backend, "ep", "/src", options);

        let paths = collect(&mut enumerator).await;
        assert_eq!(
            paths,
            vec![
                "/src/.hidden",
                "/src/a.txt",
                "/src/b.txt",
                "/src/sub",
                "/src/sub/c.txt",
                "/src/sub/deeper",
                "/src/sub/deeper/d.txt",
            ]
        );
        assert!(enumerator.error().is_none());
        assert_eq!(enumerator.directories_listed(), 3);
        assert!(enumerator.next().await.is_none());
    }

    #[tokio::test]
    async fn depth_recursion_and_hidden_filters() {
        let backend = sample_tree();

        let shallow = EnumeratorOptions {
            max_depth: Some(1),
            skip_hidden: true,
            ..Default::default()
        };
        let mut enumerator =
            StreamingEnumerator::new(backend.clone(), "ep", "/src", shallow);
        let paths = collect(&mut enumerator).await;
        assert_eq!(
            paths,
            vec!["/src/a.txt", "/src/b.txt", "/src/sub", "/src/sub/c.txt", "/src/sub/deeper"]
        );

        let flat = EnumeratorOptions {
            recursive: false,
            ..Default::default()
        };
        let mut enumerator = StreamingEnumerator::new(backend, "ep", "/src", flat);
        assert_eq!(collect(&mut enumerator).await.len(), 4);
    }

    #[tokio::test]
    async fn listing_failure_surfaces_through_error() {
        let backend = sample_tree();
        backend.fail_listing("ep", "/src/sub");
        let mut enumerator =
            StreamingEnumerator::new(backend, "ep", "/src", EnumeratorOptions::default());

        let _ = collect(&mut enumerator).await;
        let err = enumerator.error().expect("listing error");
        assert!(format!("{err:#}").contains("permission denied"));
    }

    #[tokio::test]
    async fn reset_restarts_from_root() {
        let backend = sample_tree();
        let mut enumerator = StreamingEnumerator::new(
            backend.clone(),
            "ep",
            "/src",
            EnumeratorOptions {
                workers: 1,
                ..Default::default()
            },
        );

        assert!(enumerator.next().await.is_some());
        enumerator.close();
        assert!(enumerator.next().await.is_none());

        enumerator.reset();
        assert_eq!(collect(&mut enumerator).await.len(), 7);
        assert_eq!(enumerator.entries_emitted(), 7);
    }

    #[tokio::test]
    async fn slow_consumer_holds_back_listing() {
        let backend = MemoryBackend::new();
        for dir in 0..40 {
            backend.add_file("ep", &format!("/wide/d{dir:02}/f.txt"), 1);
        }
        let backend = Arc::new(backend);
        let options = EnumeratorOptions {
            workers: 2,
            channel_capacity: 2,
            ..Default::default()
        };
        let mut enumerator = StreamingEnumerator::new(backend.clone(), "ep", "/wide", options);

        assert!(enumerator.next().await.is_some());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Both workers are parked on the full channel.
        assert!(backend.calls().list <= 3, "listed {} directories", backend.calls().list);

        let mut total = 1;
        while enumerator.next().await.is_some() {
            total += 1;
        }
        assert_eq!(total, 80);
        assert_eq!(backend.calls().list, 41);
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let backend = sample_tree();
        let mut enumerator =
            StreamingEnumerator::new(backend, "ep", "/nope", EnumeratorOptions::default());
        assert!(enumerator.next().await.is_none());
        assert!(enumerator.error().is_some());
    }
}
