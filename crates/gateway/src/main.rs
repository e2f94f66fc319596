use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use vx_domain::config::{Config, ConfigSeverity};
use vx_gateway::api;
use vx_gateway::cli::{Cli, Command, ConfigCommand};
use vx_gateway::metrics::Metrics;
use vx_gateway::runtime::cancel::CancelMap;
use vx_gateway::runtime::session_lock::SessionLockMap;
use vx_gateway::state::AppState;
use vx_providers::ProviderRegistry;
use vx_sessions::{DurableStore, FileDurableStore, IdlePolicy, SessionStore};
use vx_speech::{HttpSpeechClient, SttProvider, TtsProvider};
use vx_tools::builtin::{CalculatorTool, GetTimeTool, WebSearchTool};
use vx_tools::{ToolCache, ToolRegistry};

/// Exit code for configuration validation failures.
const EXIT_CONFIG: i32 = 2;
/// Exit code for startup health-check failures (bind, required providers).
const EXIT_STARTUP: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config_or_exit();
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config_or_exit();
            let issues = config.validate();
            for issue in &issues {
                let tag = match issue.severity {
                    ConfigSeverity::Warning => "warning",
                    ConfigSeverity::Error => "error",
                };
                eprintln!("{tag}: {issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(EXIT_CONFIG);
            }
            println!("configuration is valid");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config_or_exit();
            match toml::to_string_pretty(&config) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => {
                    eprintln!("error: could not render config: {e}");
                    std::process::exit(EXIT_CONFIG);
                }
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("voxgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vx_gateway=debug")),
        )
        .json()
        .init();
}

fn load_config_or_exit() -> Config {
    match Config::load() {
        Ok((config, Some(path))) => {
            tracing::info!(path = %path.display(), "configuration loaded");
            config
        }
        Ok((config, None)) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("VoxGate starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        tracing::error!("configuration invalid, refusing to start");
        std::process::exit(EXIT_CONFIG);
    }

    // ── Metrics ──────────────────────────────────────────────────────
    let metrics = Arc::new(Metrics::new().context("initializing metrics registry")?);

    // ── LLM providers ────────────────────────────────────────────────
    let llm = match ProviderRegistry::from_config(&config.llm) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(error = %e, "LLM provider startup check failed");
            std::process::exit(EXIT_STARTUP);
        }
    };
    if llm.is_empty() {
        tracing::warn!("no LLM providers available — conversation turns will fail until configured");
    } else {
        tracing::info!(providers = llm.len(), "LLM provider registry ready");
    }

    // ── Speech adapters ──────────────────────────────────────────────
    let stt: Option<Arc<dyn SttProvider>> = match &config.speech.stt {
        Some(cfg) => match HttpSpeechClient::from_config(cfg) {
            Ok(client) => {
                tracing::info!(base_url = %cfg.base_url, "STT adapter ready");
                Some(Arc::new(client))
            }
            Err(e) => {
                tracing::warn!(error = %e, "STT adapter failed to initialize; audio-in disabled");
                None
            }
        },
        None => None,
    };
    let tts: Option<Arc<dyn TtsProvider>> = match &config.speech.tts {
        Some(cfg) => match HttpSpeechClient::from_config(cfg) {
            Ok(client) => {
                tracing::info!(base_url = %cfg.base_url, "TTS adapter ready");
                Some(Arc::new(client))
            }
            Err(e) => {
                tracing::warn!(error = %e, "TTS adapter failed to initialize; audio-out disabled");
                None
            }
        },
        None => None,
    };

    // ── Session store (hot + durable tiers) ──────────────────────────
    let durable: Option<Arc<dyn DurableStore>> = if config.sessions.durable {
        match FileDurableStore::new(&config.sessions.state_path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!(error = %e, "durable tier unavailable; running hot-tier only");
                None
            }
        }
    } else {
        None
    };
    let sessions = Arc::new(SessionStore::new(
        config.sessions.window,
        config.sessions.max_hot_sessions,
        durable.clone(),
    ));
    tracing::info!(
        window = config.sessions.window,
        durable = durable.is_some(),
        "session store ready"
    );

    // ── Tools ────────────────────────────────────────────────────────
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(GetTimeTool));
    tools.register(Arc::new(CalculatorTool));
    if let Some(ref search_cfg) = config.tools.web_search {
        match WebSearchTool::from_config(search_cfg) {
            Ok(tool) => tools.register(Arc::new(tool)),
            Err(e) => tracing::warn!(error = %e, "web_search tool failed to initialize"),
        }
    }
    let tools = Arc::new(tools);
    let tool_cache = Arc::new(ToolCache::new(std::time::Duration::from_secs(
        config.tools.cache_ttl_secs,
    )));
    tracing::info!(tools = tools.len(), cache_ttl_secs = config.tools.cache_ttl_secs, "tool registry ready");

    // ── API keys (digested once) ─────────────────────────────────────
    let mut api_keys: HashMap<Vec<u8>, String> = HashMap::new();
    for entry in &config.server.api_keys {
        match entry.resolve() {
            Some(key) => {
                api_keys.insert(
                    Sha256::digest(key.as_bytes()).to_vec(),
                    entry.principal.clone(),
                );
            }
            None => tracing::warn!(
                principal = %entry.principal,
                "API key could not be resolved; entry skipped"
            ),
        }
    }
    if api_keys.is_empty() {
        tracing::warn!("no API keys configured — running in dev mode without authentication");
    } else {
        tracing::info!(keys = api_keys.len(), "API-key auth enabled");
    }

    // ── App state ────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        llm,
        stt,
        tts,
        sessions: sessions.clone(),
        audit: durable,
        tools,
        tool_cache: tool_cache.clone(),
        session_locks: Arc::new(SessionLockMap::new()),
        cancel_map: Arc::new(CancelMap::new()),
        metrics,
        api_keys: Arc::new(api_keys),
    };

    // ── Periodic sweeps ──────────────────────────────────────────────
    {
        let sessions = sessions.clone();
        let locks = state.session_locks.clone();
        let policy = IdlePolicy {
            idle_minutes: config.sessions.idle_minutes,
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                sessions.sweep_idle(&policy, chrono::Utc::now()).await;
                tool_cache.sweep();
                locks.prune_idle();
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────
    let cors = build_cors_layer(&config.server.allowed_origins);
    let app = api::router(state.clone())
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(EXIT_STARTUP);
        }
    };

    tracing::info!(addr = %addr, "VoxGate listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Build the CORS layer from the configured origins. A single `"*"` entry
/// allows everything (not recommended outside development).
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    use axum::http::header;

    if origins.len() == 1 && origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static("x-api-key")]);
    }

    let exact: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(_) => {
                tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(exact))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static("x-api-key")])
}
