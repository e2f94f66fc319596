//! Application configuration.
//!
//! Loaded from an optional `voxgate.toml` (path overridable via
//! `VOXGATE_CONFIG`), with every leaf overridable by a `VOXGATE_`-prefixed
//! environment variable using `__` as the section separator
//! (e.g. `VOXGATE_SERVER__PORT`, `VOXGATE_SESSIONS__WINDOW`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub turn: TurnConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Origins allowed for CORS. Use `["*"]` for permissive (NOT recommended).
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
    /// API keys accepted in `X-API-Key`. Empty list = dev mode (no auth).
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            allowed_origins: d_cors_origins(),
            api_keys: Vec::new(),
            max_concurrent_requests: d_max_concurrent(),
        }
    }
}

/// One accepted API key mapped to an opaque principal.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiKeyEntry {
    /// Plaintext key (prefer `env`).
    #[serde(default)]
    pub key: Option<String>,
    /// Environment variable holding the key.
    #[serde(default)]
    pub env: Option<String>,
    pub principal: String,
}

impl ApiKeyEntry {
    /// Resolve the key material, reading the env var if configured.
    pub fn resolve(&self) -> Option<String> {
        if let Some(ref key) = self.key {
            return Some(key.clone());
        }
        if let Some(ref var) = self.env {
            return std::env::var(var).ok().filter(|v| !v.is_empty());
        }
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Provider id used when a request names no model. Defaults to the first
    /// configured provider.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Whether startup requires at least one working provider.
    #[serde(default)]
    pub startup_policy: LlmStartupPolicy,
    #[serde(default = "d_llm_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            default_provider: None,
            startup_policy: LlmStartupPolicy::default(),
            request_timeout_secs: d_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmStartupPolicy {
    /// Boot even with zero working providers (LLM endpoints fail until fixed).
    #[default]
    AllowNone,
    /// Abort startup unless at least one provider initializes.
    RequireOne,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "d_model")]
    pub default_model: String,
    /// Models that reject sampling parameters (temperature is stripped).
    #[serde(default)]
    pub no_sampling_models: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Speech (STT / TTS)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpeechConfig {
    #[serde(default)]
    pub stt: Option<SpeechEndpointConfig>,
    #[serde(default)]
    pub tts: Option<SpeechEndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechEndpointConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Default voice for synthesis (TTS only).
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "d_speech_timeout")]
    pub timeout_secs: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Rolling history window per session (messages).
    #[serde(default = "d_window")]
    pub window: usize,
    /// Minutes of inactivity before a session is terminated.
    #[serde(default = "d_idle_minutes")]
    pub idle_minutes: u64,
    /// Hot-tier session cap; least-recently-active sessions evict beyond it.
    #[serde(default = "d_max_hot")]
    pub max_hot_sessions: usize,
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
    /// Whether the durable tier is enabled.
    #[serde(default = "d_true")]
    pub durable: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            window: d_window(),
            idle_minutes: d_idle_minutes(),
            max_hot_sessions: d_max_hot(),
            state_path: d_state_path(),
            durable: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// TTL for cached tool results.
    #[serde(default = "d_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Default per-call timeout (descriptors may override).
    #[serde(default = "d_tool_timeout")]
    pub default_timeout_secs: u64,
    /// Search endpoint for the built-in `web_search` tool.
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: d_cache_ttl(),
            default_timeout_secs: d_tool_timeout(),
            web_search: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn orchestration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Maximum ACT re-entries per turn.
    #[serde(default = "d_max_iterations")]
    pub max_tool_iterations: u32,
    /// Per-turn wall-clock deadline.
    #[serde(default = "d_deadline")]
    pub deadline_secs: u64,
    /// Keep `<debug>` markers in formatted output.
    #[serde(default)]
    pub debug: bool,
    /// Base system prompt override.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: d_max_iterations(),
            deadline_secs: d_deadline(),
            debug: false,
            system_prompt: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading & env overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Load config from `voxgate.toml` (or `$VOXGATE_CONFIG`), then apply
    /// environment overrides. A missing file yields defaults.
    pub fn load() -> crate::Result<(Self, Option<PathBuf>)> {
        let path = std::env::var("VOXGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("voxgate.toml"));

        let (mut config, loaded_from) = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&raw)
                .map_err(|e| crate::Error::Internal(format!("config parse: {e}")))?;
            (config, Some(path))
        } else {
            (Config::default(), None)
        };

        config.apply_env_overrides();
        Ok((config, loaded_from))
    }

    /// Apply `VOXGATE_<SECTION>__<FIELD>` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        override_str("SERVER__HOST", &mut self.server.host);
        override_parse("SERVER__PORT", &mut self.server.port);
        override_parse(
            "SERVER__MAX_CONCURRENT_REQUESTS",
            &mut self.server.max_concurrent_requests,
        );

        if let Some(url) = env_override("LLM__BASE_URL") {
            // A bare base-url override configures (or replaces) a single
            // default provider.
            let provider = ProviderConfig {
                id: "default".into(),
                base_url: url,
                api_key_env: Some("VOXGATE_LLM_API_KEY".into()),
                default_model: env_override("LLM__MODEL").unwrap_or_else(d_model),
                no_sampling_models: Vec::new(),
            };
            self.llm.providers = vec![provider];
            self.llm.default_provider = Some("default".into());
        } else if let Some(model) = env_override("LLM__MODEL") {
            for p in &mut self.llm.providers {
                p.default_model = model.clone();
            }
        }
        override_parse("LLM__REQUEST_TIMEOUT_SECS", &mut self.llm.request_timeout_secs);

        if let Some(url) = env_override("SPEECH__STT_BASE_URL") {
            let entry = self.speech.stt.get_or_insert_with(|| SpeechEndpointConfig {
                base_url: String::new(),
                api_key_env: Some("VOXGATE_STT_API_KEY".into()),
                model: None,
                voice: None,
                timeout_secs: d_speech_timeout(),
            });
            entry.base_url = url;
        }
        if let Some(url) = env_override("SPEECH__TTS_BASE_URL") {
            let entry = self.speech.tts.get_or_insert_with(|| SpeechEndpointConfig {
                base_url: String::new(),
                api_key_env: Some("VOXGATE_TTS_API_KEY".into()),
                model: None,
                voice: None,
                timeout_secs: d_speech_timeout(),
            });
            entry.base_url = url;
        }

        override_parse("SESSIONS__WINDOW", &mut self.sessions.window);
        override_parse("SESSIONS__IDLE_MINUTES", &mut self.sessions.idle_minutes);
        override_parse("SESSIONS__MAX_HOT_SESSIONS", &mut self.sessions.max_hot_sessions);
        if let Some(p) = env_override("SESSIONS__STATE_PATH") {
            self.sessions.state_path = PathBuf::from(p);
        }
        override_parse("SESSIONS__DURABLE", &mut self.sessions.durable);

        override_parse("TOOLS__CACHE_TTL_SECS", &mut self.tools.cache_ttl_secs);
        override_parse(
            "TOOLS__DEFAULT_TIMEOUT_SECS",
            &mut self.tools.default_timeout_secs,
        );

        override_parse("TURN__MAX_TOOL_ITERATIONS", &mut self.turn.max_tool_iterations);
        override_parse("TURN__DEADLINE_SECS", &mut self.turn.deadline_secs);
        override_parse("TURN__DEBUG", &mut self.turn.debug);
    }

    /// Validate the config, returning all issues found.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.sessions.window == 0 {
            issues.push(ConfigIssue::error("sessions.window must be at least 1"));
        }
        if self.sessions.max_hot_sessions == 0 {
            issues.push(ConfigIssue::error("sessions.max_hot_sessions must be at least 1"));
        }
        if self.turn.max_tool_iterations == 0 {
            issues.push(ConfigIssue::error("turn.max_tool_iterations must be at least 1"));
        }
        if self.turn.deadline_secs == 0 {
            issues.push(ConfigIssue::error("turn.deadline_secs must be at least 1"));
        }
        for provider in &self.llm.providers {
            if provider.base_url.is_empty() {
                issues.push(ConfigIssue::error(format!(
                    "llm provider '{}' has an empty base_url",
                    provider.id
                )));
            }
        }
        if let Some(ref default) = self.llm.default_provider {
            if !self.llm.providers.iter().any(|p| &p.id == default) {
                issues.push(ConfigIssue::error(format!(
                    "llm.default_provider '{default}' does not name a configured provider"
                )));
            }
        }
        for entry in &self.server.api_keys {
            if entry.key.is_none() && entry.env.is_none() {
                issues.push(ConfigIssue::error(format!(
                    "api key for principal '{}' has neither 'key' nor 'env'",
                    entry.principal
                )));
            }
            if entry.key.is_some() {
                issues.push(ConfigIssue::warning(format!(
                    "api key for principal '{}' is plaintext in config; prefer 'env'",
                    entry.principal
                )));
            }
        }
        if self.llm.providers.is_empty() {
            issues.push(ConfigIssue::warning(
                "no LLM providers configured; conversation endpoints will fail",
            ));
        }

        issues
    }
}

/// Severity of a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn env_override(suffix: &str) -> Option<String> {
    std::env::var(format!("VOXGATE_{suffix}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn override_str(suffix: &str, target: &mut String) {
    if let Some(v) = env_override(suffix) {
        *target = v;
    }
}

fn override_parse<T: std::str::FromStr>(suffix: &str, target: &mut T) {
    if let Some(v) = env_override(suffix) {
        match v.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = %format!("VOXGATE_{suffix}"), value = %v, "ignoring unparseable env override"),
        }
    }
}

// ── Serde default helpers ─────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3100
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into(), "http://127.0.0.1:3000".into()]
}
fn d_max_concurrent() -> usize {
    256
}
fn d_llm_timeout() -> u64 {
    120
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_speech_timeout() -> u64 {
    30
}
fn d_window() -> usize {
    20
}
fn d_idle_minutes() -> u64 {
    30
}
fn d_max_hot() -> usize {
    1024
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_cache_ttl() -> u64 {
    300
}
fn d_tool_timeout() -> u64 {
    10
}
fn d_max_iterations() -> u32 {
    5
}
fn d_deadline() -> u64 {
    60
}
fn d_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.sessions.window, 20);
        assert_eq!(config.sessions.idle_minutes, 30);
        assert_eq!(config.tools.cache_ttl_secs, 300);
        assert_eq!(config.turn.max_tool_iterations, 5);
        assert_eq!(config.turn.deadline_secs, 60);
    }

    #[test]
    fn parses_minimal_toml() {
        let raw = r#"
            [server]
            port = 8080

            [[llm.providers]]
            id = "main"
            base_url = "https://api.example.com/v1"
            api_key_env = "EXAMPLE_KEY"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.llm.providers.len(), 1);
        assert_eq!(config.llm.providers[0].default_model, "gpt-4o-mini");
    }

    #[test]
    fn env_override_wins() {
        std::env::set_var("VOXGATE_SESSIONS__WINDOW", "7");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.sessions.window, 7);
        std::env::remove_var("VOXGATE_SESSIONS__WINDOW");
    }

    #[test]
    fn unparseable_env_override_ignored() {
        std::env::set_var("VOXGATE_TURN__DEADLINE_SECS", "soon");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.turn.deadline_secs, 60);
        std::env::remove_var("VOXGATE_TURN__DEADLINE_SECS");
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut config = Config::default();
        config.sessions.window = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("window")));
    }

    #[test]
    fn validate_rejects_unknown_default_provider() {
        let mut config = Config::default();
        config.llm.default_provider = Some("ghost".into());
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("ghost")));
    }

    #[test]
    fn api_key_entry_resolves_env() {
        std::env::set_var("VOXGATE_TEST_KEY_77", "secret");
        let entry = ApiKeyEntry {
            key: None,
            env: Some("VOXGATE_TEST_KEY_77".into()),
            principal: "tester".into(),
        };
        assert_eq!(entry.resolve().as_deref(), Some("secret"));
        std::env::remove_var("VOXGATE_TEST_KEY_77");
    }
}
