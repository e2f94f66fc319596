//! Per-turn cancellation.
//!
//! Each running turn registers a token keyed by session id. The token fires
//! on explicit client cancellation (disconnect, `cancel`, `barge-in`) or when
//! the per-turn deadline passes; the orchestrator distinguishes the two so a
//! deadline persists a timeout apology while a client cancel stays silent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Why a token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    Live,
    /// Client asked to stop (disconnect, cancel, barge-in).
    Cancelled,
    /// The per-turn wall-clock deadline passed.
    DeadlineExceeded,
}

/// Cancellation token checked and awaited by the turn loop.
#[derive(Clone)]
pub struct CancelToken {
    inner: CancellationToken,
    deadline_hit: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: CancellationToken::new(),
            deadline_hit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Arm the per-turn deadline: after `deadline` the token fires and reads
    /// as [`CancelStatus::DeadlineExceeded`].
    pub fn arm_deadline(&self, deadline: Duration) {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    token.deadline_hit.store(true, Ordering::Release);
                    token.inner.cancel();
                }
                _ = token.inner.cancelled() => {}
            }
        });
    }

    /// Signal client-side cancellation.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves when the token fires; used in `select!` around suspension
    /// points so a stuck provider stream is abandoned promptly.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    pub fn status(&self) -> CancelStatus {
        if !self.inner.is_cancelled() {
            CancelStatus::Live
        } else if self.deadline_hit.load(Ordering::Acquire) {
            CancelStatus::DeadlineExceeded
        } else {
            CancelStatus::Cancelled
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Active cancellation tokens keyed by session id.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a token for a session's running turn.
    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(session_id.to_owned(), token.clone());
        token
    }

    /// Cancel the running turn for a session. Returns whether one was found.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.tokens.lock().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token when a turn completes.
    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_lifecycle() {
        let token = CancelToken::new();
        assert_eq!(token.status(), CancelStatus::Live);
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.status(), CancelStatus::Cancelled);
    }

    #[tokio::test]
    async fn deadline_reads_as_deadline_exceeded() {
        let token = CancelToken::new();
        token.arm_deadline(Duration::from_millis(10));
        token.cancelled().await;
        assert_eq!(token.status(), CancelStatus::DeadlineExceeded);
    }

    #[tokio::test]
    async fn explicit_cancel_beats_deadline() {
        let token = CancelToken::new();
        token.arm_deadline(Duration::from_secs(60));
        token.cancel();
        assert_eq!(token.status(), CancelStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            7
        });
        token.cancel();
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let token = map.register("s1");
        assert!(map.is_running("s1"));
        assert!(map.cancel("s1"));
        assert!(token.is_cancelled());
        map.remove("s1");
        assert!(!map.is_running("s1"));
        assert!(!map.cancel("s1"));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
