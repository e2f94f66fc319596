use std::collections::HashMap;
use std::sync::Arc;

use vx_domain::config::Config;
use vx_providers::ProviderRegistry;
use vx_sessions::{DurableStore, SessionStore};
use vx_speech::{SttProvider, TtsProvider};
use vx_tools::{ToolCache, ToolRegistry};

use crate::metrics::Metrics;
use crate::runtime::cancel::CancelMap;
use crate::runtime::session_lock::SessionLockMap;

/// Shared application state passed to all API handlers.
///
/// Everything is constructed once at startup and injected here; there is no
/// process-global mutable state. Tests assemble the same struct from mocks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── External capabilities ─────────────────────────────────────────
    pub llm: Arc<ProviderRegistry>,
    /// `None` when no STT endpoint is configured; audio-in routes then fail
    /// with `external_unavailable`.
    pub stt: Option<Arc<dyn SttProvider>>,
    /// `None` when no TTS endpoint is configured.
    pub tts: Option<Arc<dyn TtsProvider>>,

    // ── Conversation state ────────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    /// Tool-call audit sink (shares the durable tier with the session store).
    pub audit: Option<Arc<dyn DurableStore>>,

    // ── Tools ─────────────────────────────────────────────────────────
    pub tools: Arc<ToolRegistry>,
    pub tool_cache: Arc<ToolCache>,

    // ── Turn coordination ─────────────────────────────────────────────
    pub session_locks: Arc<SessionLockMap>,
    pub cancel_map: Arc<CancelMap>,

    // ── Observability & auth ──────────────────────────────────────────
    pub metrics: Arc<Metrics>,
    /// SHA-256 digest of each accepted API key → principal. Empty = dev
    /// mode (no auth enforced).
    pub api_keys: Arc<HashMap<Vec<u8>, String>>,
}
