#![allow(dead_code)]

use std::sync::Arc;

use ferry_core::backend::MemoryBackend;
use ferry_core::checkpoint::{CheckpointStore, MemoryCheckpointStore, TransferOptions};
use ferry_core::orchestrator::{Orchestrator, TransferRequest};
use ferry_core::retry::RetryPolicy;

/// `/src` with a.txt (10), b.txt (20) and sub/c.txt (30) on endpoint `src`.
pub fn sample_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.add_file("src", "/src/a.txt", 10);
    backend.add_file("src", "/src/b.txt", 20);
    backend.add_file("src", "/src/sub/c.txt", 30);
    backend.add_dir("dst", "/dst");
    backend
}

pub fn request() -> TransferRequest {
    TransferRequest::new("src", "/src", "dst", "/dst")
}

/// Options that keep polling and checkpoint ticks short.
pub fn fast_options(batch_size: usize) -> TransferOptions {
    TransferOptions {
        batch_size,
        max_concurrent_tasks: 2,
        poll_interval_ms: 1,
        checkpoint_interval_ms: 25,
        enumeration_workers: 2,
        ..Default::default()
    }
}

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub store: Arc<MemoryCheckpointStore>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn harness(backend: MemoryBackend) -> Harness {
    let backend = Arc::new(backend);
    let store = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = Orchestrator::new(backend.clone(), store.clone() as Arc<dyn CheckpointStore>)
        .with_retry_policy(RetryPolicy::immediate(3));
    Harness {
        backend,
        store,
        orchestrator: Arc::new(orchestrator),
    }
}
