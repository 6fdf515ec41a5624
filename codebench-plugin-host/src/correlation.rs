//! Request-reply correlation over an async message channel.
//!
//! Generic over the reply payload: callers register a pending request,
//! send their message tagged with the returned id, and await the reply
//! with a timeout. Whoever reads the channel completes or fails pending
//! entries by id; a channel teardown rejects everything at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Why a pending request did not produce a reply payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplyError {
    /// No reply arrived within the deadline.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The remote side answered with an error.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The channel went away before a reply arrived (e.g. process exit).
    #[error("channel closed: {0}")]
    Closed(String),
}

/// Correlates outbound requests with inbound replies by id.
#[derive(Debug)]
pub struct RequestTracker<T> {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<T, ReplyError>>>>,
}

impl<T> RequestTracker<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new pending request, returning its id and the reply
    /// receiver.
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<T, ReplyError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        (id, rx)
    }

    /// Completes a pending request with a reply payload.
    /// Returns false if the id was unknown (e.g. already timed out).
    pub fn complete(&self, id: u64, value: T) -> bool {
        self.finish(id, Ok(value))
    }

    /// Fails a pending request.
    pub fn fail(&self, id: u64, error: ReplyError) -> bool {
        self.finish(id, Err(error))
    }

    /// Drops a pending request without completing it (timeout cleanup).
    pub fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Fails every pending request, e.g. when the channel dies.
    pub fn reject_all(&self, error: &ReplyError)
    where
        T: Send,
    {
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return,
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Number of requests still awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Awaits a registered reply with a deadline. On timeout the pending
    /// entry is removed so a late reply cannot leak.
    pub async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<T, ReplyError>>,
        timeout: Duration,
    ) -> Result<T, ReplyError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ReplyError::Closed("reply channel dropped".into())),
            Err(_) => {
                self.forget(id);
                Err(ReplyError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn finish(&self, id: u64, result: Result<T, ReplyError>) -> bool {
        let tx = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

impl<T> Default for RequestTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_waiter() {
        let tracker: RequestTracker<u32> = RequestTracker::new();
        let (id, rx) = tracker.register();

        assert!(tracker.complete(id, 42));
        let reply = tracker.wait(id, rx, Duration::from_secs(1)).await;
        assert_eq!(reply, Ok(42));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_rejects_waiter() {
        let tracker: RequestTracker<u32> = RequestTracker::new();
        let (id, rx) = tracker.register();

        tracker.fail(id, ReplyError::Rejected("no".into()));
        let reply = tracker.wait(id, rx, Duration::from_secs(1)).await;
        assert_eq!(reply, Err(ReplyError::Rejected("no".into())));
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let tracker: RequestTracker<u32> = RequestTracker::new();
        let (id, rx) = tracker.register();

        let reply = tracker.wait(id, rx, Duration::from_millis(10)).await;
        assert!(matches!(reply, Err(ReplyError::Timeout { .. })));
        assert_eq!(tracker.pending_count(), 0);

        // A reply arriving after the timeout finds nothing to complete.
        assert!(!tracker.complete(id, 1));
    }

    #[tokio::test]
    async fn reject_all_fails_every_pending_request() {
        let tracker: RequestTracker<u32> = RequestTracker::new();
        let (id1, rx1) = tracker.register();
        let (id2, rx2) = tracker.register();
        assert_ne!(id1, id2);

        tracker.reject_all(&ReplyError::Closed("worker exited".into()));

        let r1 = tracker.wait(id1, rx1, Duration::from_secs(1)).await;
        let r2 = tracker.wait(id2, rx2, Duration::from_secs(1)).await;
        assert_eq!(r1, Err(ReplyError::Closed("worker exited".into())));
        assert_eq!(r2, Err(ReplyError::Closed("worker exited".into())));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn ids_are_monotonic() {
        let tracker: RequestTracker<()> = RequestTracker::new();
        let (a, _rx1) = tracker.register();
        let (b, _rx2) = tracker.register();
        let (c, _rx3) = tracker.register();
        assert!(a < b && b < c);
    }
}
