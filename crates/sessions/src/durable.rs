//! Durable tier of the session store.
//!
//! Layout under the state path:
//! - `sessions.json` — index of session metadata
//! - `sessions/<id>.jsonl` — one message per line, append-only
//! - `tool_calls.jsonl` — tool-call audit log, append-only
//!
//! The hot tier writes through after its own append and hydrates misses via
//! [`DurableStore::load_recent`]. Failures here are logged by the caller and
//! never fail the live request.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use vx_domain::error::{Error, Result};
use vx_domain::message::{turn_groups, Message};

use crate::history::SessionMeta;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One audited tool dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub session_id: String,
    pub turn_id: String,
    pub name: String,
    pub args: Value,
    pub result: Value,
    pub success: bool,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// Storage contract for the cold tier.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
    /// Persist one turn group and the session's current metadata.
    async fn append_turn(&self, meta: &SessionMeta, messages: &[Message]) -> Result<()>;

    /// Load the most recent window of messages (whole turn groups only).
    /// Returns `None` for an unknown session.
    async fn load_recent(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Option<(SessionMeta, Vec<Message>)>>;

    /// Update session metadata without appending messages.
    async fn update_meta(&self, meta: &SessionMeta) -> Result<()>;

    /// Append to the tool-call audit log.
    async fn log_tool_call(&self, record: &ToolCallRecord) -> Result<()>;

    /// Remove a session's messages and index entry.
    async fn clear(&self, session_id: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-backed implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FileDurableStore {
    sessions_dir: PathBuf,
    index_path: PathBuf,
    tool_log_path: PathBuf,
    index: Mutex<HashMap<String, SessionMeta>>,
    /// Serializes appends to the shared audit log.
    tool_log_lock: Mutex<()>,
}

impl FileDurableStore {
    /// Open (or create) the store under `state_path`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let sessions_dir = state_path.join("sessions");
        std::fs::create_dir_all(&sessions_dir)?;

        let index_path = state_path.join("sessions.json");
        let index = if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = index.len(),
            path = %index_path.display(),
            "durable session store loaded"
        );

        Ok(Self {
            sessions_dir,
            index_path,
            tool_log_path: state_path.join("tool_calls.jsonl"),
            index: Mutex::new(index),
            tool_log_lock: Mutex::new(()),
        })
    }

    fn message_path(&self, session_id: &str) -> PathBuf {
        // Session ids are server-minted UUIDs or client-provided strings;
        // sanitize the latter so they cannot escape the sessions dir.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.sessions_dir.join(format!("{safe}.jsonl"))
    }

    fn flush_index(&self) -> Result<()> {
        let json = {
            let index = self.index.lock();
            serde_json::to_string_pretty(&*index)?
        };
        std::fs::write(&self.index_path, json)?;
        Ok(())
    }

    fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut buf = String::new();
        for item in items {
            buf.push_str(&serde_json::to_string(item)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableStore for FileDurableStore {
    async fn append_turn(&self, meta: &SessionMeta, messages: &[Message]) -> Result<()> {
        Self::append_lines(&self.message_path(&meta.id), messages)?;
        self.index.lock().insert(meta.id.clone(), meta.clone());
        self.flush_index()
    }

    async fn load_recent(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Option<(SessionMeta, Vec<Message>)>> {
        let meta = match self.index.lock().get(session_id) {
            Some(m) => m.clone(),
            None => return Ok(None),
        };

        let path = self.message_path(session_id);
        if !path.exists() {
            return Ok(Some((meta, Vec::new())));
        }

        let raw = std::fs::read_to_string(&path)?;
        let messages: Vec<Message> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping corrupt message line");
                    None
                }
            })
            .collect();

        // Take whole turn groups from the end until the window is full, so a
        // hydrated history never starts mid-turn.
        let groups = turn_groups(&messages);
        let mut taken = 0usize;
        let mut start_group = groups.len();
        while start_group > 0 && taken + groups[start_group - 1].len() <= limit {
            taken += groups[start_group - 1].len();
            start_group -= 1;
        }
        let recent: Vec<Message> = groups[start_group..]
            .iter()
            .flat_map(|g| g.iter().cloned())
            .collect();

        Ok(Some((meta, recent)))
    }

    async fn update_meta(&self, meta: &SessionMeta) -> Result<()> {
        self.index.lock().insert(meta.id.clone(), meta.clone());
        self.flush_index()
    }

    async fn log_tool_call(&self, record: &ToolCallRecord) -> Result<()> {
        let _guard = self.tool_log_lock.lock();
        Self::append_lines(&self.tool_log_path, std::slice::from_ref(record))
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.index.lock().remove(session_id);
        self.flush_index()?;
        let path = self.message_path(session_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(Error::from)?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{SessionStatus, SessionStore};
    use std::sync::Arc;
    use vx_domain::message::ToolCall;

    fn meta(id: &str) -> SessionMeta {
        SessionMeta {
            id: id.into(),
            user_id: None,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            last_activity: Utc::now(),
        }
    }

    fn tool_turn(turn_id: &str) -> Vec<Message> {
        vec![
            Message::user(turn_id, "q"),
            Message::assistant_tool_calls(
                turn_id,
                "",
                vec![ToolCall {
                    id: format!("{turn_id}-c"),
                    name: "web_search".into(),
                    arguments: serde_json::json!({}),
                }],
            ),
            Message::tool(turn_id, format!("{turn_id}-c"), "r"),
            Message::assistant(turn_id, "a"),
        ]
    }

    #[tokio::test]
    async fn round_trips_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).unwrap();
        let m = meta("s1");
        store
            .append_turn(&m, &[Message::user("t1", "hi"), Message::assistant("t1", "hey")])
            .await
            .unwrap();

        let (loaded_meta, messages) = store.load_recent("s1", 20).await.unwrap().unwrap();
        assert_eq!(loaded_meta.id, "s1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
    }

    #[tokio::test]
    async fn unknown_session_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).unwrap();
        assert!(store.load_recent("ghost", 20).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_recent_respects_turn_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).unwrap();
        let m = meta("s1");
        store.append_turn(&m, &tool_turn("t1")).await.unwrap();
        store.append_turn(&m, &tool_turn("t2")).await.unwrap();

        // Limit of 6 fits only one whole 4-message group.
        let (_, messages) = store.load_recent("s1", 6).await.unwrap().unwrap();
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|msg| msg.turn_id == "t2"));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).unwrap();
        let m = meta("s1");
        store.append_turn(&m, &tool_turn("t1")).await.unwrap();
        store.clear("s1").await.unwrap();
        assert!(store.load_recent("s1", 20).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileDurableStore::new(dir.path()).unwrap();
            store.append_turn(&meta("s1"), &tool_turn("t1")).await.unwrap();
        }
        let reopened = FileDurableStore::new(dir.path()).unwrap();
        let (m, messages) = reopened.load_recent("s1", 20).await.unwrap().unwrap();
        assert_eq!(m.id, "s1");
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn tool_call_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).unwrap();
        let record = ToolCallRecord {
            call_id: "c1".into(),
            session_id: "s1".into(),
            turn_id: "t1".into(),
            name: "get_time".into(),
            args: serde_json::json!({}),
            result: serde_json::json!({"time": "now"}),
            success: true,
            duration_ms: 3,
            started_at: Utc::now(),
        };
        store.log_tool_call(&record).await.unwrap();
        store.log_tool_call(&record).await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("tool_calls.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[tokio::test]
    async fn hostile_session_id_stays_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(dir.path()).unwrap();
        let m = meta("../../escape");
        store.append_turn(&m, &[Message::user("t1", "hi")]).await.unwrap();
        // The file landed inside the sessions dir, not above it.
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn hot_store_hydrates_from_durable() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(FileDurableStore::new(dir.path()).unwrap());
        durable
            .append_turn(&meta("s1"), &tool_turn("t1"))
            .await
            .unwrap();

        // A fresh hot tier has never seen s1; it must hydrate.
        let hot = SessionStore::new(20, 1024, Some(durable));
        let (m, is_new) = hot.resolve_or_create(Some("s1"), None).await;
        assert!(!is_new);
        assert_eq!(m.id, "s1");
        assert_eq!(hot.history("s1").await.len(), 4);
    }
}
