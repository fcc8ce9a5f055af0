use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checkpoint::CheckpointState;

/// Observer invoked with a snapshot of the transfer on every checkpoint tick
/// and every finished batch.
pub type ProgressCallback = Arc<dyn Fn(&CheckpointState) + Send + Sync>;

const QUEUE_DEPTH: usize = 16;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A callback together with the gate every consumer holds while calling it.
/// Runs that share a sink never invoke the callback concurrently, including
/// a consumer that was detached by [`ProgressNotifier::finish`].
#[derive(Clone)]
pub(crate) struct ProgressSink {
    callback: ProgressCallback,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl ProgressSink {
    pub(crate) fn new(callback: ProgressCallback) -> Self {
        Self {
            callback,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn deliver(&self, state: &CheckpointState) {
        let _turn = self.gate.lock().await;
        (self.callback)(state);
    }
}

/// Per-run queue in front of a [`ProgressSink`], drained by one consumer
/// task. Producers never wait: when the queue is full the event is dropped.
pub(crate) struct ProgressNotifier {
    tx: Option<mpsc::Sender<CheckpointState>>,
    consumer: Option<JoinHandle<()>>,
    dropped: AtomicU64,
}

impl ProgressNotifier {
    pub(crate) fn spawn(sink: Option<ProgressSink>) -> Self {
        let Some(sink) = sink else {
            return Self::disabled();
        };

        let (tx, mut rx) = mpsc::channel::<CheckpointState>(QUEUE_DEPTH);
        let consumer = tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                sink.deliver(&state).await;
            }
        });

        Self {
            tx: Some(tx),
            consumer: Some(consumer),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            tx: None,
            consumer: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a snapshot. `snapshot` only runs when there is room for it.
    pub(crate) fn notify(&self, snapshot: impl FnOnce() -> CheckpointState) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_reserve() {
            Ok(permit) => permit.send(snapshot()),
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and let the consumer deliver what is left.
    pub(crate) async fn finish(mut self) {
        self.tx.take();
        if let Some(consumer) = self.consumer.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, consumer).await.is_err() {
                log::warn!("progress callback still busy after {:?}; detaching", DRAIN_TIMEOUT);
            }
        }
        let dropped = self.dropped();
        if dropped > 0 {
            log::debug!("{dropped} progress event(s) dropped while the callback was busy");
        }
    }
}
