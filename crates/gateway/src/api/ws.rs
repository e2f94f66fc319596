//! Full-duplex socket endpoint.
//!
//! Server→client frames are the same JSON events as the SSE stream.
//! Client→server control frames: `message` (start a text turn), `cancel`,
//! `barge-in` (cancel the in-flight turn, including an active speech
//! stream), `audio.chunk` + `audio.end` (live microphone input, run as an
//! audio turn once the chunk stream ends). Disconnecting cancels whatever is
//! running.

use axum::extract::ws::{Message as WsFrame, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use vx_domain::error::Error;
use vx_domain::event::{AgentEvent, ControlEvent};
use vx_speech::{SttProvider, SttRequest, MAX_AUDIO_BYTES};

use crate::runtime::{run_turn, TurnInput, VoiceParams};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /conversation/ws — upgrade to the duplex event socket.
pub async fn conversation_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Single outbound writer; turn-forwarding tasks feed it.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(json) = out_rx.recv().await {
            if ws_sink.send(WsFrame::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // The session this socket is talking in (set by the first turn) and the
    // live-microphone buffer for the audio.chunk/audio.end flow.
    let mut active_session: Option<String> = None;
    let mut mic_buffer: Vec<u8> = Vec::new();

    while let Some(frame) = ws_stream.next().await {
        let control = match frame {
            Ok(WsFrame::Text(text)) => match serde_json::from_str::<ControlEvent>(&text) {
                Ok(ev) => ev,
                Err(e) => {
                    send_error(
                        &out_tx,
                        &Error::InputInvalid(format!("unrecognized control event: {e}")),
                    )
                    .await;
                    continue;
                }
            },
            // Binary frames are treated as raw microphone audio.
            Ok(WsFrame::Binary(bytes)) => {
                buffer_audio(&out_tx, &mut mic_buffer, &bytes).await;
                continue;
            }
            Ok(WsFrame::Close(_)) | Err(_) => break,
            Ok(_) => continue, // ping/pong handled by the transport
        };

        match control {
            ControlEvent::Message {
                text,
                session_id,
                output_mode,
                voice,
            } => {
                let session = resolve_ws_session(&state, session_id, &mut active_session).await;
                start_turn(
                    &state,
                    &out_tx,
                    TurnInput {
                        session_id: session,
                        user_id: None,
                        text,
                        output_mode,
                        voice: VoiceParams {
                            voice,
                            ..VoiceParams::default()
                        },
                        model: None,
                    },
                );
            }

            ControlEvent::Cancel | ControlEvent::BargeIn => {
                if let Some(ref session) = active_session {
                    if state.cancel_map.cancel(session) {
                        tracing::debug!(session_id = %session, "turn cancelled over socket");
                    }
                }
            }

            ControlEvent::AudioChunk { bytes } => {
                match base64::engine::general_purpose::STANDARD.decode(bytes.as_bytes()) {
                    Ok(decoded) => buffer_audio(&out_tx, &mut mic_buffer, &decoded).await,
                    Err(_) => {
                        send_error(
                            &out_tx,
                            &Error::InputInvalid("audio.chunk bytes are not valid base64".into()),
                        )
                        .await;
                    }
                }
            }

            ControlEvent::AudioEnd {
                session_id,
                output_mode,
                voice,
            } => {
                let audio = std::mem::take(&mut mic_buffer);
                match transcribe(&state, audio).await {
                    Ok(text) => {
                        let session =
                            resolve_ws_session(&state, session_id, &mut active_session).await;
                        start_turn(
                            &state,
                            &out_tx,
                            TurnInput {
                                session_id: session,
                                user_id: None,
                                text,
                                output_mode,
                                voice: VoiceParams {
                                    voice,
                                    ..VoiceParams::default()
                                },
                                model: None,
                            },
                        );
                    }
                    Err(e) => send_error(&out_tx, &e).await,
                }
            }
        }
    }

    // Client went away: whatever is in flight stops now.
    if let Some(ref session) = active_session {
        state.cancel_map.cancel(session);
    }
    drop(out_tx);
    let _ = writer.await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn resolve_ws_session(
    state: &AppState,
    requested: Option<String>,
    active: &mut Option<String>,
) -> String {
    let id = match requested.or_else(|| active.clone()) {
        Some(id) => {
            let (meta, _) = state.sessions.resolve_or_create(Some(&id), None).await;
            meta.id
        }
        None => {
            let (meta, _) = state.sessions.resolve_or_create(None, None).await;
            meta.id
        }
    };
    *active = Some(id.clone());
    id
}

/// Spawn the turn and a forwarder piping its events to the socket writer.
fn start_turn(state: &AppState, out_tx: &mpsc::Sender<String>, input: TurnInput) {
    let state = state.clone();
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let session_id = input.session_id.clone();
        // Serialize turns per session, like the HTTP surface does.
        let permit = match state.session_locks.acquire(&session_id).await {
            Ok(p) => p,
            Err(e) => {
                send_error(&out_tx, &Error::Internal(e.to_string())).await;
                return;
            }
        };

        let (_turn_id, mut rx) = run_turn(state, input);
        while let Some(event) = rx.recv().await {
            let json = serde_json::to_string(&event).unwrap_or_default();
            if out_tx.send(json).await.is_err() {
                // Socket writer is gone; the turn's cancel fires via the
                // socket close path.
                break;
            }
        }
        drop(permit);
    });
}

async fn buffer_audio(out_tx: &mpsc::Sender<String>, buffer: &mut Vec<u8>, chunk: &[u8]) {
    if buffer.len() + chunk.len() > MAX_AUDIO_BYTES {
        buffer.clear();
        send_error(
            out_tx,
            &Error::InputInvalid(format!("live audio exceeds {MAX_AUDIO_BYTES} bytes")),
        )
        .await;
        return;
    }
    buffer.extend_from_slice(chunk);
}

async fn transcribe(state: &AppState, audio: Vec<u8>) -> Result<String, Error> {
    let stt = state
        .stt
        .clone()
        .ok_or_else(|| Error::unavailable("stt", "no STT endpoint configured"))?;
    if audio.is_empty() {
        return Err(Error::InputInvalid("no audio received before audio.end".into()));
    }
    let transcript = stt.transcribe(SttRequest::new(audio)).await?;
    Ok(transcript.text)
}

async fn send_error(out_tx: &mpsc::Sender<String>, err: &Error) {
    let json = serde_json::to_string(&AgentEvent::error(err)).unwrap_or_default();
    let _ = out_tx.send(json).await;
}
