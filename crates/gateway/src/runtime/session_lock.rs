//! Per-session concurrency control.
//!
//! A turn owns its session for its whole duration: a second request for the
//! same session waits for the running turn to finish. Across sessions there
//! is no coordination at all.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Maps each session id to a `Semaphore(1)` run lock.
#[derive(Default)]
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the run lock for a session, waiting if a turn is in flight.
    /// The permit releases on drop.
    pub async fn acquire(&self, session_id: &str) -> Result<OwnedSemaphorePermit, SessionBusy> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.acquire_owned().await.map_err(|_| SessionBusy)
    }

    /// Acquire without waiting. `Err(SessionBusy)` when a turn is running.
    pub fn try_acquire(&self, session_id: &str) -> Result<OwnedSemaphorePermit, SessionBusy> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.try_acquire_owned().map_err(|_| SessionBusy)
    }

    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop lock entries for sessions with no turn running or waiting.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

/// A turn is already in progress for this session.
#[derive(Debug)]
pub struct SessionBusy;

impl std::fmt::Display for SessionBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session is busy — a turn is already in progress")
    }
}

impl std::error::Error for SessionBusy {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_turns_same_session() {
        let map = SessionLockMap::new();
        let p1 = map.acquire("s1").await.unwrap();
        drop(p1);
        let p2 = map.acquire("s1").await.unwrap();
        drop(p2);
    }

    #[tokio::test]
    async fn different_sessions_run_concurrently() {
        let map = SessionLockMap::new();
        let _p1 = map.acquire("s1").await.unwrap();
        let _p2 = map.acquire("s2").await.unwrap();
        assert_eq!(map.session_count(), 2);
    }

    #[tokio::test]
    async fn second_turn_waits_for_first() {
        let map = Arc::new(SessionLockMap::new());
        let p1 = map.acquire("s1").await.unwrap();

        let waiter = map.clone();
        let handle = tokio::spawn(async move {
            let _p2 = waiter.acquire("s1").await.unwrap();
            "ran"
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        drop(p1);
        assert_eq!(handle.await.unwrap(), "ran");
    }

    #[tokio::test]
    async fn try_acquire_rejects_while_held() {
        let map = SessionLockMap::new();
        let _p = map.acquire("s1").await.unwrap();
        assert!(map.try_acquire("s1").is_err());
    }

    #[tokio::test]
    async fn prune_drops_released_locks() {
        let map = SessionLockMap::new();
        let permit = map.acquire("s1").await.unwrap();
        map.prune_idle();
        assert_eq!(map.session_count(), 1); // held -> kept
        drop(permit);
        map.prune_idle();
        assert_eq!(map.session_count(), 0);
    }
}
