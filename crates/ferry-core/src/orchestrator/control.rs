use std::sync::Arc;

use tokio::sync::watch;

/// Why a running transfer stopped scheduling new batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `Orchestrator::stop` was called. State is saved and stays resumable.
    Requested,
    /// The resume deadline elapsed. Same outcome as `Requested`.
    Deadline,
    /// The checkpoint was deleted. Nothing more is saved.
    Cancelled,
}

/// Shared stop signal observed by every unit of a run.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Cancellation overrides an earlier stop; otherwise the
    /// first reason wins. Returns whether the reason changed.
    pub fn stop(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|current| match *current {
            None => {
                *current = Some(reason);
                true
            }
            Some(StopReason::Cancelled) => false,
            Some(_) if reason == StopReason::Cancelled => {
                *current = Some(reason);
                true
            }
            Some(_) => false,
        })
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.tx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the signal is raised.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

/// Stop signal of one transfer plus the lock that orders its checkpoint
/// saves against `Orchestrator::cancel`.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunControl {
    pub(crate) stop: StopHandle,
    pub(crate) persist_lock: Arc<tokio::sync::Mutex<()>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_see_the_reason() {
        let handle = StopHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(handle.stop(StopReason::Requested));
        assert_eq!(waiter.await.unwrap(), StopReason::Requested);

        // Already raised: resolves immediately.
        assert_eq!(handle.stopped().await, StopReason::Requested);
    }

    #[test]
    fn cancellation_wins() {
        let handle = StopHandle::new();
        assert!(handle.stop(StopReason::Deadline));
        assert!(!handle.stop(StopReason::Requested));
        assert!(handle.stop(StopReason::Cancelled));
        assert!(!handle.stop(StopReason::Requested));
        assert_eq!(handle.reason(), Some(StopReason::Cancelled));
    }
}
