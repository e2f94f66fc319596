//! Conversation endpoints — the four request pipelines plus history access.
//!
//! - `POST /conversation/message`              — text in, JSON out
//! - `POST /conversation/message-stream`       — text in, SSE event stream
//! - `POST /conversation/message-audio`        — multipart audio in, JSON out
//! - `POST /conversation/message-audio-stream` — multipart audio in, SSE
//! - `GET  /conversation/history/:session_id`  — hot history window
//! - `DELETE /conversation/clear/:session_id`  — clear both tiers

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures_util::stream::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::Instrument;

use vx_domain::error::Error;
use vx_domain::event::{AgentEvent, OutputMode};
use vx_speech::{AudioFormat, SttProvider, SttRequest};

use crate::runtime::{run_turn, TurnInput, VoiceParams};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageRequest {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
    #[serde(default)]
    pub pitch: Option<f32>,
    #[serde(default)]
    pub volume: Option<f32>,
    /// Optional model spec ("provider/model" or bare model name).
    #[serde(default)]
    pub model: Option<String>,
}

impl MessageRequest {
    fn voice_params(&self) -> VoiceParams {
        VoiceParams {
            voice: self.voice.clone(),
            speed: self.speed,
            pitch: self.pitch,
            volume: self.volume,
        }
    }
}

/// Map an error kind to the HTTP status used for buffered responses.
fn kind_status(kind: &str) -> StatusCode {
    match kind {
        "input_invalid" => StatusCode::BAD_REQUEST,
        "auth_denied" => StatusCode::UNAUTHORIZED,
        "external_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "backpressure" | "cancelled" => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: &Error) -> Response {
    (
        kind_status(err.kind()),
        Json(serde_json::json!({
            "error": { "kind": err.kind(), "message": err.user_message() }
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn setup shared by all four pipelines
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PreparedTurn {
    input: TurnInput,
    permit: tokio::sync::OwnedSemaphorePermit,
}

/// Resolve the session and take its run lock (waiting behind an in-flight
/// turn), then build the [`TurnInput`].
async fn prepare_turn(state: &AppState, req: &MessageRequest) -> Result<PreparedTurn, Error> {
    let (meta, _is_new) = state
        .sessions
        .resolve_or_create(req.session_id.as_deref(), req.user_id.as_deref())
        .await;

    let permit = state
        .session_locks
        .acquire(&meta.id)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    Ok(PreparedTurn {
        input: TurnInput {
            session_id: meta.id,
            user_id: req.user_id.clone(),
            text: req.text.clone(),
            output_mode: req.output_mode,
            voice: req.voice_params(),
            model: req.model.clone(),
        },
        permit,
    })
}

/// Everything a buffered (non-streaming) caller needs from a drained turn.
#[derive(Default)]
struct DrainedTurn {
    turn_id: String,
    text: String,
    tool_calls: usize,
    warnings: Vec<String>,
    error: Option<(String, String)>,
}

async fn drain_turn(mut rx: mpsc::Receiver<AgentEvent>) -> DrainedTurn {
    let mut drained = DrainedTurn::default();
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Start { turn_id, .. } => drained.turn_id = turn_id,
            AgentEvent::TextDelta { chunk, .. } => drained.text.push_str(&chunk),
            AgentEvent::ToolStart { .. } => drained.tool_calls += 1,
            AgentEvent::Warning { code, .. } => drained.warnings.push(code),
            AgentEvent::Error { kind, message, .. } => drained.error = Some((kind, message)),
            AgentEvent::End { .. } | AgentEvent::ToolEnd { .. } | AgentEvent::AudioChunk { .. } => {}
        }
    }
    drained
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /conversation/message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn message(
    State(state): State<AppState>,
    Json(body): Json<MessageRequest>,
) -> Response {
    run_buffered(state, body).await
}

async fn run_buffered(state: AppState, body: MessageRequest) -> Response {
    let started = std::time::Instant::now();
    let prepared = match prepare_turn(&state, &body).await {
        Ok(p) => p,
        Err(e) => return api_error(&e),
    };
    let session_id = prepared.input.session_id.clone();
    let user_input = prepared.input.text.clone();

    let (_turn_id, rx) = run_turn(state.clone(), prepared.input);
    let drained = drain_turn(rx).await;
    drop(prepared.permit);

    let agent_response = if state.config.turn.debug {
        drained.text
    } else {
        crate::runtime::strip_debug_markers(&drained.text)
    };

    let status = drained
        .error
        .as_ref()
        .map(|(kind, _)| kind_status(kind))
        .unwrap_or(StatusCode::OK);

    let mut payload = serde_json::json!({
        "success": drained.error.is_none(),
        "session_id": session_id,
        "user_input": user_input,
        "agent_response": if drained.error.is_none() {
            agent_response
        } else {
            drained.error.as_ref().map(|(_, m)| m.clone()).unwrap_or_default()
        },
        "timestamp": Utc::now().to_rfc3339(),
        "metadata": {
            "turn_id": drained.turn_id,
            "tool_calls": drained.tool_calls,
            "warnings": drained.warnings,
            "latency_ms": started.elapsed().as_millis() as u64,
        },
    });
    if let Some((kind, message)) = drained.error {
        payload["error"] = serde_json::json!({ "kind": kind, "message": message });
    }

    (status, Json(payload)).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /conversation/message-stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn message_stream(
    State(state): State<AppState>,
    Json(body): Json<MessageRequest>,
) -> Response {
    run_streaming(state, body).await
}

async fn run_streaming(state: AppState, body: MessageRequest) -> Response {
    let prepared = match prepare_turn(&state, &body).await {
        Ok(p) => p,
        Err(e) => return api_error(&e),
    };
    let (_turn_id, rx) = run_turn(state, prepared.input);
    Sse::new(sse_stream(rx, prepared.permit))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_stream(
    mut rx: mpsc::Receiver<AgentEvent>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.name()).data(data));
        }
        // _permit drops here, releasing the session run lock.
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /conversation/message-audio[-stream]
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn message_audio(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Response {
    match transcribe_multipart(&state, multipart).await {
        Ok(body) => run_buffered(state, body).await,
        Err(e) => api_error(&e),
    }
}

pub async fn message_audio_stream(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Response {
    match transcribe_multipart(&state, multipart).await {
        Ok(body) => run_streaming(state, body).await,
        Err(e) => api_error(&e),
    }
}

/// Pull the audio blob + fields out of the multipart form and transcribe.
/// Raw audio is dropped as soon as the transcript exists.
async fn transcribe_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<MessageRequest, Error> {
    let stt = state
        .stt
        .clone()
        .ok_or_else(|| Error::unavailable("stt", "no STT endpoint configured"))?;

    let mut audio: Vec<u8> = Vec::new();
    let mut declared_format: Option<AudioFormat> = None;
    let mut language: Option<String> = None;
    let mut body = MessageRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InputInvalid(format!("bad multipart form: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "audio" | "file" => {
                audio = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InputInvalid(format!("bad audio part: {e}")))?
                    .to_vec();
            }
            "format" => declared_format = AudioFormat::parse(&text_field(field).await?),
            "language" => language = Some(text_field(field).await?),
            "session_id" => body.session_id = Some(text_field(field).await?),
            "user_id" => body.user_id = Some(text_field(field).await?),
            "output_mode" => {
                let raw = text_field(field).await?;
                body.output_mode = match raw.as_str() {
                    "audio" => OutputMode::Audio,
                    "both" => OutputMode::Both,
                    _ => OutputMode::Text,
                };
            }
            "voice" => body.voice = Some(text_field(field).await?),
            "speed" => body.speed = text_field(field).await?.parse().ok(),
            "pitch" => body.pitch = text_field(field).await?.parse().ok(),
            "volume" => body.volume = text_field(field).await?.parse().ok(),
            "model" => body.model = Some(text_field(field).await?),
            _ => {}
        }
    }

    if audio.is_empty() {
        return Err(Error::InputInvalid("no audio part in form".into()));
    }

    let span = tracing::info_span!("stt.transcribe", bytes = audio.len());
    let transcript = stt
        .transcribe(SttRequest {
            audio,
            format: declared_format,
            language,
        })
        .instrument(span)
        .await?;

    tracing::debug!(
        chars = transcript.text.len(),
        duration_ms = transcript.duration_ms,
        "audio transcribed"
    );
    body.text = transcript.text;
    Ok(body)
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, Error> {
    field
        .text()
        .await
        .map_err(|e| Error::InputInvalid(format!("bad form field: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /conversation/history/:session_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let messages = state.sessions.history(&session_id).await;
    Json(serde_json::json!({
        "session_id": session_id,
        "count": messages.len(),
        "messages": messages,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /conversation/clear/:session_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn clear(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    state.sessions.clear(&session_id).await;
    tracing::info!(session_id = %session_id, "session cleared");
    Json(serde_json::json!({ "success": true, "session_id": session_id }))
}
