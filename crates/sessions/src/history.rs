//! Hot-tier session store.
//!
//! Sessions live in a fixed set of lock shards; each holds a rolling window
//! of at most W messages. Appends land as whole turn groups and eviction only
//! ever removes whole groups, so history never begins with an orphan
//! tool-result message. An optional durable tier receives write-through
//! appends and hydrates hot misses; durable failures are counted and logged
//! but never fail the request.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use vx_domain::message::Message;

use crate::durable::DurableStore;
use crate::lifecycle::IdlePolicy;

const SHARDS: usize = 16;

/// Inactivity threshold after which a session reads as idle (but not yet
/// terminated).
const IDLE_AFTER_MINUTES: i64 = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionMeta {
    fn new(id: String, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        }
    }

    /// Status as observed at `now`: an active session reads as idle after a
    /// few minutes of silence.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SessionStatus {
        if self.status == SessionStatus::Terminated {
            return SessionStatus::Terminated;
        }
        if now.signed_duration_since(self.last_activity) >= Duration::minutes(IDLE_AFTER_MINUTES)
        {
            SessionStatus::Idle
        } else {
            SessionStatus::Active
        }
    }
}

struct SessionState {
    meta: SessionMeta,
    history: VecDeque<Message>,
}

/// Store-wide counters for the stats endpoint and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub hot_sessions: usize,
    pub hot_messages: usize,
    pub durable_backed: bool,
    pub durable_errors: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    shards: Vec<Mutex<HashMap<String, SessionState>>>,
    window: usize,
    max_hot_sessions: usize,
    durable: Option<Arc<dyn DurableStore>>,
    durable_errors: AtomicU64,
}

impl SessionStore {
    pub fn new(
        window: usize,
        max_hot_sessions: usize,
        durable: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        let shards = (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            window,
            max_hot_sessions,
            durable,
            durable_errors: AtomicU64::new(0),
        }
    }

    fn shard(&self, session_id: &str) -> &Mutex<HashMap<String, SessionState>> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Resolve an existing session or mint a new one. Returns `(meta, is_new)`.
    ///
    /// A hot miss consults the durable tier before minting so a session
    /// survives hot-tier eviction.
    pub async fn resolve_or_create(
        &self,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> (SessionMeta, bool) {
        if let Some(id) = session_id {
            {
                let shard = self.shard(id).lock();
                if let Some(state) = shard.get(id) {
                    return (state.meta.clone(), false);
                }
            }
            // Hot miss: hydrate from durable if possible.
            if let Some(state) = self.hydrate(id).await {
                let meta = state.meta.clone();
                self.insert_state(state);
                return (meta, false);
            }
            let meta = SessionMeta::new(id.to_string(), user_id.map(String::from));
            self.insert_state(SessionState {
                meta: meta.clone(),
                history: VecDeque::new(),
            });
            tracing::info!(session_id = %id, "session created (client-provided id)");
            return (meta, true);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let meta = SessionMeta::new(id.clone(), user_id.map(String::from));
        self.insert_state(SessionState {
            meta: meta.clone(),
            history: VecDeque::new(),
        });
        tracing::info!(session_id = %id, "session created (server-minted id)");
        (meta, true)
    }

    async fn hydrate(&self, session_id: &str) -> Option<SessionState> {
        let durable = self.durable.as_ref()?;
        match durable.load_recent(session_id, self.window).await {
            Ok(Some((meta, messages))) => {
                tracing::debug!(session_id, messages = messages.len(), "hydrated from durable tier");
                Some(SessionState {
                    meta,
                    history: messages.into(),
                })
            }
            Ok(None) => None,
            Err(e) => {
                self.durable_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session_id, error = %e, "durable hydration failed");
                None
            }
        }
    }

    fn insert_state(&self, state: SessionState) {
        let id = state.meta.id.clone();
        let mut shard = self.shard(&id).lock();
        shard.insert(id, state);

        // Shard-local LRU cap: evict the least-recently-active session when
        // this shard exceeds its share of the hot budget.
        let cap = (self.max_hot_sessions / SHARDS).max(1);
        if shard.len() > cap {
            if let Some(oldest) = shard
                .values()
                .min_by_key(|s| s.meta.last_activity)
                .map(|s| s.meta.id.clone())
            {
                shard.remove(&oldest);
                tracing::debug!(session_id = %oldest, "evicted session from hot tier (LRU)");
            }
        }
    }

    /// The most-recent window of messages for a session, hydrating a hot
    /// miss from the durable tier.
    pub async fn history(&self, session_id: &str) -> Vec<Message> {
        {
            let shard = self.shard(session_id).lock();
            if let Some(state) = shard.get(session_id) {
                return state.history.iter().cloned().collect();
            }
        }
        if let Some(state) = self.hydrate(session_id).await {
            let history = state.history.iter().cloned().collect();
            self.insert_state(state);
            return history;
        }
        Vec::new()
    }

    /// Append one turn's messages as an atomic group, then write through to
    /// the durable tier. A read immediately after this from the same caller
    /// sees the append.
    pub async fn append_turn(&self, session_id: &str, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }

        let meta = {
            let mut shard = self.shard(session_id).lock();
            // Appending to an unknown session recreates it; normal flow goes
            // through resolve_or_create first.
            let state = shard.entry(session_id.to_string()).or_insert_with(|| SessionState {
                meta: SessionMeta::new(session_id.to_string(), None),
                history: VecDeque::new(),
            });

            state.history.extend(messages.iter().cloned());
            state.meta.last_activity = Utc::now();
            state.meta.status = SessionStatus::Active;
            evict_whole_turns(&mut state.history, self.window, &messages[0].turn_id);
            state.meta.clone()
        };

        // Durable write-through happens outside the shard lock.
        if let Some(ref durable) = self.durable {
            if let Err(e) = durable.append_turn(&meta, messages).await {
                self.durable_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session_id, error = %e, "durable append failed; hot tier remains authoritative");
            }
        }
    }

    /// Remove a session from both tiers.
    pub async fn clear(&self, session_id: &str) {
        {
            let mut shard = self.shard(session_id).lock();
            shard.remove(session_id);
        }
        if let Some(ref durable) = self.durable {
            if let Err(e) = durable.clear(session_id).await {
                self.durable_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session_id, error = %e, "durable clear failed");
            }
        }
    }

    /// Refresh last-activity (called when a turn starts).
    pub fn touch(&self, session_id: &str) {
        let mut shard = self.shard(session_id).lock();
        if let Some(state) = shard.get_mut(session_id) {
            state.meta.last_activity = Utc::now();
            state.meta.status = SessionStatus::Active;
        }
    }

    pub fn get_meta(&self, session_id: &str) -> Option<SessionMeta> {
        let shard = self.shard(session_id).lock();
        shard.get(session_id).map(|s| s.meta.clone())
    }

    /// Terminate and evict sessions idle past the policy threshold.
    /// Returns the number of sessions evicted.
    pub async fn sweep_idle(&self, policy: &IdlePolicy, now: DateTime<Utc>) -> usize {
        let mut expired: Vec<SessionMeta> = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            let ids: Vec<String> = shard
                .values()
                .filter(|s| policy.is_expired(s.meta.last_activity, now))
                .map(|s| s.meta.id.clone())
                .collect();
            for id in ids {
                if let Some(mut state) = shard.remove(&id) {
                    state.meta.status = SessionStatus::Terminated;
                    expired.push(state.meta);
                }
            }
        }

        let count = expired.len();
        if let Some(ref durable) = self.durable {
            for meta in &expired {
                if let Err(e) = durable.update_meta(meta).await {
                    self.durable_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(session_id = %meta.id, error = %e, "durable status update failed");
                }
            }
        }
        if count > 0 {
            tracing::info!(count, "terminated idle sessions");
        }
        count
    }

    pub fn stats(&self) -> StoreStats {
        let mut hot_sessions = 0;
        let mut hot_messages = 0;
        for shard in &self.shards {
            let shard = shard.lock();
            hot_sessions += shard.len();
            hot_messages += shard.values().map(|s| s.history.len()).sum::<usize>();
        }
        StoreStats {
            hot_sessions,
            hot_messages,
            durable_backed: self.durable.is_some(),
            durable_errors: self.durable_errors.load(Ordering::Relaxed),
        }
    }
}

/// Evict whole turn groups from the front until the window fits.
///
/// The group just appended (`current_turn`) is never evicted, so a single
/// oversized turn may transiently exceed the window rather than be split.
fn evict_whole_turns(history: &mut VecDeque<Message>, window: usize, current_turn: &str) {
    while history.len() > window {
        let front_turn = match history.front() {
            Some(m) if m.turn_id != current_turn => m.turn_id.clone(),
            _ => break,
        };
        while history
            .front()
            .map(|m| m.turn_id == front_turn)
            .unwrap_or(false)
        {
            history.pop_front();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use vx_domain::message::{Role, ToolCall};

    fn store(window: usize) -> SessionStore {
        SessionStore::new(window, 1024, None)
    }

    fn simple_turn(turn_id: &str) -> Vec<Message> {
        vec![
            Message::user(turn_id, "question"),
            Message::assistant(turn_id, "answer"),
        ]
    }

    fn tool_turn(turn_id: &str) -> Vec<Message> {
        let call = ToolCall {
            id: format!("{turn_id}-c1"),
            name: "web_search".into(),
            arguments: serde_json::json!({"query": "x"}),
        };
        vec![
            Message::user(turn_id, "question"),
            Message::assistant_tool_calls(turn_id, "", vec![call]),
            Message::tool(turn_id, format!("{turn_id}-c1"), "result"),
            Message::assistant(turn_id, "answer"),
        ]
    }

    #[tokio::test]
    async fn read_after_append_sees_messages() {
        let store = store(20);
        let (meta, is_new) = store.resolve_or_create(None, None).await;
        assert!(is_new);
        store.append_turn(&meta.id, &simple_turn("t1")).await;
        let history = store.history(&meta.id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn sessions_do_not_mix() {
        let store = store(20);
        let (a, _) = store.resolve_or_create(Some("session-a"), None).await;
        let (b, _) = store.resolve_or_create(Some("session-b"), None).await;
        store.append_turn(&a.id, &simple_turn("t1")).await;
        assert!(store.history(&b.id).await.is_empty());
        assert_eq!(store.history(&a.id).await.len(), 2);
    }

    #[tokio::test]
    async fn window_never_exceeded_for_simple_turns() {
        let store = store(6);
        let (meta, _) = store.resolve_or_create(Some("s"), None).await;
        for i in 0..10 {
            store.append_turn(&meta.id, &simple_turn(&format!("t{i}"))).await;
            assert!(store.history(&meta.id).await.len() <= 6);
        }
        // Oldest turns gone, newest intact, still aligned on turn boundaries.
        let history = store.history(&meta.id).await;
        assert_eq!(history.len(), 6);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].turn_id, "t7");
    }

    #[tokio::test]
    async fn eviction_removes_whole_tool_group() {
        let store = store(6);
        let (meta, _) = store.resolve_or_create(Some("s"), None).await;
        store.append_turn(&meta.id, &tool_turn("t1")).await; // 4 messages
        store.append_turn(&meta.id, &tool_turn("t2")).await; // would be 8 -> evict t1 wholly
        let history = store.history(&meta.id).await;
        assert_eq!(history.len(), 4);
        assert!(history.iter().all(|m| m.turn_id == "t2"));
        // Never an orphan tool-result at the head.
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn oversized_current_turn_is_not_split() {
        let store = store(3);
        let (meta, _) = store.resolve_or_create(Some("s"), None).await;
        store.append_turn(&meta.id, &tool_turn("t1")).await;
        let history = store.history(&meta.id).await;
        // Current turn (4 messages) exceeds the window but stays intact.
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn clear_then_history_is_empty() {
        let store = store(20);
        let (meta, _) = store.resolve_or_create(Some("s"), None).await;
        store.append_turn(&meta.id, &simple_turn("t1")).await;
        store.clear(&meta.id).await;
        assert!(store.history(&meta.id).await.is_empty());
    }

    #[tokio::test]
    async fn consecutive_appends_are_not_deduped() {
        let store = store(20);
        let (meta, _) = store.resolve_or_create(Some("s"), None).await;
        store.append_turn(&meta.id, &simple_turn("t1")).await;
        store.append_turn(&meta.id, &simple_turn("t2")).await;
        assert_eq!(store.history(&meta.id).await.len(), 4);
    }

    #[tokio::test]
    async fn resolve_existing_returns_same_meta() {
        let store = store(20);
        let (first, is_new) = store.resolve_or_create(Some("fixed"), Some("alice")).await;
        assert!(is_new);
        let (second, is_new) = store.resolve_or_create(Some("fixed"), None).await;
        assert!(!is_new);
        assert_eq!(first.id, second.id);
        assert_eq!(second.user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn stats_count_sessions_and_messages() {
        let store = store(20);
        let (a, _) = store.resolve_or_create(Some("a"), None).await;
        let (b, _) = store.resolve_or_create(Some("b"), None).await;
        store.append_turn(&a.id, &simple_turn("t1")).await;
        store.append_turn(&b.id, &tool_turn("t1")).await;
        let stats = store.stats();
        assert_eq!(stats.hot_sessions, 2);
        assert_eq!(stats.hot_messages, 6);
        assert!(!stats.durable_backed);
        assert_eq!(stats.durable_errors, 0);
    }

    #[tokio::test]
    async fn sweep_terminates_idle_sessions() {
        let store = store(20);
        let (meta, _) = store.resolve_or_create(Some("old"), None).await;
        let policy = IdlePolicy { idle_minutes: 30 };
        // Not yet idle.
        assert_eq!(store.sweep_idle(&policy, Utc::now()).await, 0);
        // Pretend 31 minutes pass.
        let later = Utc::now() + Duration::minutes(31);
        assert_eq!(store.sweep_idle(&policy, later).await, 1);
        assert!(store.get_meta(&meta.id).is_none());
    }

    #[test]
    fn effective_status_transitions() {
        let meta = SessionMeta::new("s".into(), None);
        let now = Utc::now();
        assert_eq!(meta.effective_status(now), SessionStatus::Active);
        assert_eq!(
            meta.effective_status(now + Duration::minutes(IDLE_AFTER_MINUTES + 1)),
            SessionStatus::Idle
        );
    }
}
