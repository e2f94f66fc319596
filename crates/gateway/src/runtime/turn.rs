//! The turn orchestrator.
//!
//! One turn runs on a single logical task driving an explicit state machine:
//! INPUT → (FAST_PATH | REASON ⇄ ACT) → FORMAT → DONE, with ERROR as the
//! sink for failures. The ACT fan-out is internal to the turn; externally the
//! turn is strictly sequential. Entry point: [`run_turn`] spawns the task and
//! returns the turn id plus a receiver of [`AgentEvent`]s.

use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use vx_domain::error::Error;
use vx_domain::event::{AgentEvent, OutputMode};
use vx_domain::message::{Message, ToolCall, ToolResult};
use vx_domain::stream::StreamEvent;
use vx_providers::{retry::with_retry, ChatRequest};
use vx_sessions::{DurableStore, ToolCallRecord};
use vx_tools::{fingerprint, ToolContext};

use crate::runtime::audio::{self, VoiceParams};
use crate::runtime::cancel::{CancelStatus, CancelToken};
use crate::runtime::greeting;
use crate::runtime::sink::{EventSink, DEFAULT_BUFFER, DEFAULT_GRACE};
use crate::runtime::{strip_debug_markers, BOUNDED_LOOP_APOLOGY, DEFAULT_SYSTEM_PROMPT};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to one turn. The session must already be resolved (and its run lock
/// held) by the caller.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub session_id: String,
    pub user_id: Option<String>,
    pub text: String,
    pub output_mode: OutputMode,
    pub voice: VoiceParams,
    /// Optional model spec ("provider/model" or bare model name).
    pub model: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Input,
    FastPath,
    Reason,
    Act,
    Format,
    Error,
    Done,
}

/// Ephemeral state for one turn; discarded when the turn ends.
struct TurnState {
    session_id: String,
    turn_id: String,
    user_input: String,
    /// Messages accumulated this turn (user, assistant tool-call rounds,
    /// tool results). Committed as one atomic group at FORMAT.
    messages: Vec<Message>,
    pending_tool_calls: Vec<ToolCall>,
    tool_results: Vec<ToolResult>,
    /// ACT entries so far; bounded by `max_tool_iterations`.
    tool_call_count: u32,
    max_tool_iterations: u32,
    final_text: String,
    next_action: Phase,
    error: Option<Error>,
    /// Set once the turn group has been committed to history.
    committed: bool,
}

impl TurnState {
    fn new(session_id: String, turn_id: String, user_input: String, max_tool_iterations: u32) -> Self {
        Self {
            session_id,
            turn_id,
            user_input,
            messages: Vec::new(),
            pending_tool_calls: Vec::new(),
            tool_results: Vec::new(),
            tool_call_count: 0,
            max_tool_iterations,
            final_text: String::new(),
            next_action: Phase::Input,
            error: None,
            committed: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn — entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn on its own task.
///
/// Returns the turn id and a receiver the caller drains (streamed to the
/// client, or collected for the buffered JSON response). A cancel token is
/// registered under the session id so `cancel`/`barge-in`/disconnect can stop
/// the turn; the per-turn deadline is armed on the same token.
pub fn run_turn(state: AppState, input: TurnInput) -> (String, mpsc::Receiver<AgentEvent>) {
    let turn_id = uuid::Uuid::new_v4().to_string();
    let (sink, rx) = EventSink::channel(DEFAULT_BUFFER, DEFAULT_GRACE);

    let cancel = state.cancel_map.register(&input.session_id);
    cancel.arm_deadline(Duration::from_secs(state.config.turn.deadline_secs));

    state.metrics.turns_started.inc();
    state.metrics.streams_in_flight.inc();

    let span = tracing::info_span!(
        "turn",
        turn_id = %turn_id,
        session_id = %input.session_id,
        "otel.kind" = "SERVER",
    );

    let task_state = state.clone();
    let task_turn_id = turn_id.clone();
    tokio::spawn(
        async move {
            let started = Instant::now();
            let session_id = input.session_id.clone();

            drive(&task_state, input, &task_turn_id, sink, &cancel).await;

            // Fire the token so the deadline watchdog task winds down.
            cancel.cancel();
            task_state.cancel_map.remove(&session_id);
            task_state.metrics.streams_in_flight.dec();
            task_state
                .metrics
                .turn_duration
                .observe(started.elapsed().as_secs_f64());
            tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "turn finished");
        }
        .instrument(span),
    );

    (turn_id, rx)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// drive — the state loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn drive(
    state: &AppState,
    input: TurnInput,
    turn_id: &str,
    mut sink: EventSink,
    cancel: &CancelToken,
) {
    state.sessions.touch(&input.session_id);

    if sink
        .send(AgentEvent::start(turn_id, &input.session_id))
        .await
        .is_err()
    {
        state.metrics.turns_cancelled.inc();
        return;
    }

    let history = state.sessions.history(&input.session_id).await;
    let mut ts = TurnState::new(
        input.session_id.clone(),
        turn_id.to_string(),
        input.text.clone(),
        state.config.turn.max_tool_iterations,
    );

    loop {
        let step = match ts.next_action {
            Phase::Input => input_phase(&mut ts),
            Phase::FastPath => fast_path_phase(&mut ts, &mut sink, &input).await,
            Phase::Reason => reason_phase(state, &mut ts, &mut sink, cancel, &input, &history).await,
            Phase::Act => act_phase(state, &mut ts, &mut sink, cancel, &input).await,
            Phase::Format => format_phase(state, &mut ts, &mut sink, cancel, &input).await,
            Phase::Error => {
                let err = ts.error.take().unwrap_or_else(|| {
                    Error::Internal("turn entered ERROR with no error recorded".into())
                });
                finish_with_error(state, &mut ts, &mut sink, err).await;
                return;
            }
            Phase::Done => {
                state
                    .metrics
                    .turns_completed
                    .with_label_values(&["ok"])
                    .inc();
                return;
            }
        };

        match step {
            Ok(next) => ts.next_action = next,
            Err(e) => {
                ts.error = Some(e);
                ts.next_action = Phase::Error;
            }
        }
    }
}

/// Map a fired cancel token to the error that describes why.
fn cancel_error(cancel: &CancelToken) -> Error {
    match cancel.status() {
        CancelStatus::DeadlineExceeded => Error::Timeout("turn deadline exceeded".into()),
        _ => Error::Cancelled,
    }
}

/// Terminal handling for every non-success path.
///
/// Cancellation is silent: nothing is persisted or emitted. Everything else
/// commits the turn-so-far plus a friendly fallback assistant message (unless
/// FORMAT already committed) and emits the terminal `error` event.
async fn finish_with_error(state: &AppState, ts: &mut TurnState, sink: &mut EventSink, err: Error) {
    if matches!(err, Error::Cancelled) {
        state.metrics.turns_cancelled.inc();
        tracing::debug!(turn_id = %ts.turn_id, "turn cancelled; nothing persisted");
        return;
    }

    tracing::warn!(turn_id = %ts.turn_id, kind = err.kind(), error = %err, "turn failed");

    if !ts.committed && !ts.messages.is_empty() {
        let mut group = ts.messages.clone();
        group.push(Message::assistant(&ts.turn_id, err.user_message()));
        state.sessions.append_turn(&ts.session_id, &group).await;
        ts.committed = true;
    }

    sink.send_terminal(AgentEvent::error(&err));
    state
        .metrics
        .turns_completed
        .with_label_values(&["error"])
        .inc();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// INPUT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn input_phase(ts: &mut TurnState) -> Result<Phase, Error> {
    let trimmed = ts.user_input.trim().to_string();
    if trimmed.is_empty() {
        return Err(Error::InputInvalid("message text is empty".into()));
    }

    ts.messages.push(Message::user(&ts.turn_id, &trimmed));
    ts.user_input = trimmed.clone();

    if greeting::is_greeting(&trimmed) {
        Ok(Phase::FastPath)
    } else {
        Ok(Phase::Reason)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FAST_PATH
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn fast_path_phase(
    ts: &mut TurnState,
    sink: &mut EventSink,
    input: &TurnInput,
) -> Result<Phase, Error> {
    let reply = greeting::canned_reply(&ts.session_id);
    tracing::debug!(turn_id = %ts.turn_id, "greeting fast path, skipping LLM");

    if input.output_mode.wants_text() {
        sink.send(AgentEvent::text_delta(reply)).await?;
    }
    ts.final_text = reply.to_string();
    Ok(Phase::Format)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// REASON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn reason_phase(
    state: &AppState,
    ts: &mut TurnState,
    sink: &mut EventSink,
    cancel: &CancelToken,
    input: &TurnInput,
    history: &[Message],
) -> Result<Phase, Error> {
    let (provider, model) = state
        .llm
        .resolve(input.model.as_deref())
        .ok_or_else(|| Error::unavailable("llm", "no LLM provider configured"))?;

    let system_prompt = format!(
        "{}\n\nToday's date is {}.",
        state
            .config
            .turn
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT),
        Utc::now().format("%Y-%m-%d"),
    );

    let mut messages = Vec::with_capacity(1 + history.len() + ts.messages.len());
    messages.push(Message::system(system_prompt));
    messages.extend(history.iter().cloned());
    messages.extend(ts.messages.iter().cloned());

    let req = ChatRequest {
        messages,
        tools: state.tools.describe(),
        model: Some(model.clone()),
        temperature: Some(0.2),
        ..Default::default()
    };

    let llm_span = tracing::info_span!(
        "llm.call",
        "otel.kind" = "CLIENT",
        model = %model,
        round = ts.tool_call_count,
    );

    let llm_started = Instant::now();
    let connect = {
        let provider = provider.clone();
        let req = req.clone();
        with_retry(Duration::from_millis(250), move || {
            let provider = provider.clone();
            let req = req.clone();
            async move { provider.chat_stream(req).await }
        })
    };
    let mut stream = match connect.instrument(llm_span.clone()).await {
        Ok(stream) => stream,
        Err(e) => {
            state
                .metrics
                .llm_calls
                .with_label_values(&[model.as_str(), "error"])
                .inc();
            return Err(e);
        }
    };

    let mut text_buf = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut first_token_seen = false;

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = cancel.cancelled() => {
                // Dropping the stream closes the provider connection.
                return Err(cancel_error(cancel));
            }
        };
        let Some(item) = item else { break };

        match item? {
            StreamEvent::Token { text } => {
                if !first_token_seen {
                    first_token_seen = true;
                    state
                        .metrics
                        .llm_first_token
                        .observe(llm_started.elapsed().as_secs_f64());
                }
                if input.output_mode.wants_text() {
                    sink.send(AgentEvent::text_delta(&text)).await?;
                }
                text_buf.push_str(&text);
            }
            // Aggregation happens in the adapter; only complete calls count.
            StreamEvent::ToolCallStarted { .. } | StreamEvent::ToolCallDelta { .. } => {}
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                tool_calls.push(ToolCall {
                    id: call_id,
                    name: tool_name,
                    arguments,
                });
            }
            StreamEvent::Done { .. } => {}
            StreamEvent::Error { message } => {
                state
                    .metrics
                    .llm_calls
                    .with_label_values(&[model.as_str(), "error"])
                    .inc();
                return Err(Error::unavailable("llm", message));
            }
        }
    }

    state
        .metrics
        .llm_calls
        .with_label_values(&[model.as_str(), "ok"])
        .inc();

    if tool_calls.is_empty() {
        ts.final_text = text_buf;
        return Ok(Phase::Format);
    }

    ts.messages.push(Message::assistant_tool_calls(
        &ts.turn_id,
        text_buf,
        tool_calls.clone(),
    ));
    ts.pending_tool_calls = tool_calls;
    Ok(Phase::Act)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ACT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn act_phase(
    state: &AppState,
    ts: &mut TurnState,
    sink: &mut EventSink,
    cancel: &CancelToken,
    input: &TurnInput,
) -> Result<Phase, Error> {
    let calls = std::mem::take(&mut ts.pending_tool_calls);

    for call in &calls {
        sink.send(AgentEvent::tool_start(
            &call.id,
            &call.name,
            call.arguments.clone(),
        ))
        .await?;
    }

    if cancel.is_cancelled() {
        return Err(cancel_error(cancel));
    }

    let ctx = ToolContext {
        session_id: ts.session_id.clone(),
        user_id: input.user_id.clone(),
    };

    // Fan out one sub-task per call; failures are isolated per call and the
    // join preserves the original call order.
    let dispatches = calls.iter().map(|call| {
        let ctx = ctx.clone();
        async move {
            let started_at = Utc::now();
            let cacheable = state
                .tools
                .descriptor(&call.name)
                .map(|d| d.cacheable)
                .unwrap_or(false);
            let fp = fingerprint(&call.name, &call.arguments);
            let (mut result, cache_hit) = state
                .tool_cache
                .get_or_compute(&fp, cacheable, || state.tools.dispatch(call, &ctx))
                .await;
            // A cached result keeps its payload but answers the current call.
            if result.call_id != call.id {
                result.call_id = call.id.clone();
            }
            (result, cache_hit, started_at)
        }
    });

    let results = tokio::select! {
        results = join_all(dispatches) => results,
        _ = cancel.cancelled() => {
            // In-flight dispatches are dropped; late completions are never
            // persisted.
            return Err(cancel_error(cancel));
        }
    };

    for (call, (result, cache_hit, started_at)) in calls.iter().zip(results) {
        state
            .metrics
            .tool_cache
            .with_label_values(&[if cache_hit { "hit" } else { "miss" }])
            .inc();
        state
            .metrics
            .tool_calls
            .with_label_values(&[call.name.as_str(), if result.success { "ok" } else { "error" }])
            .inc();
        state
            .metrics
            .tool_duration
            .with_label_values(&[call.name.as_str()])
            .observe(result.duration_ms as f64 / 1000.0);

        sink.send(AgentEvent::tool_end(
            &call.id,
            result.success,
            result.error.as_ref().map(|e| e.message.clone()),
        ))
        .await?;

        ts.messages.push(Message::tool(
            &ts.turn_id,
            &call.id,
            result.content_for_model(),
        ));

        if let Some(ref audit) = state.audit {
            let record = ToolCallRecord {
                call_id: call.id.clone(),
                session_id: ts.session_id.clone(),
                turn_id: ts.turn_id.clone(),
                name: call.name.clone(),
                args: call.arguments.clone(),
                result: result.data.clone(),
                success: result.success,
                duration_ms: result.duration_ms,
                started_at,
            };
            if let Err(e) = audit.log_tool_call(&record).await {
                tracing::warn!(error = %e, "tool-call audit write failed");
            }
        }

        ts.tool_results.push(result);
    }

    ts.tool_call_count += 1;
    if ts.tool_call_count >= ts.max_tool_iterations {
        tracing::warn!(
            turn_id = %ts.turn_id,
            iterations = ts.tool_call_count,
            "tool iteration bound reached, forcing FORMAT"
        );
        sink.send(AgentEvent::warning(
            "tool-iteration-cap",
            format!(
                "stopped after {} tool rounds without a final answer",
                ts.tool_call_count
            ),
        ))
        .await?;
        if ts.final_text.is_empty() {
            ts.final_text = BOUNDED_LOOP_APOLOGY.to_string();
        }
        return Ok(Phase::Format);
    }

    Ok(Phase::Reason)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORMAT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn format_phase(
    state: &AppState,
    ts: &mut TurnState,
    sink: &mut EventSink,
    cancel: &CancelToken,
    input: &TurnInput,
) -> Result<Phase, Error> {
    // Nothing is persisted for a turn cancelled before the commit below.
    if cancel.is_cancelled() {
        return Err(cancel_error(cancel));
    }

    if !state.config.turn.debug {
        ts.final_text = strip_debug_markers(&ts.final_text);
    }
    tracing::debug!(
        turn_id = %ts.turn_id,
        rounds = ts.tool_call_count,
        tool_results = ts.tool_results.len(),
        chars = ts.final_text.len(),
        "formatting final reply"
    );

    let mut group = ts.messages.clone();
    group.push(Message::assistant(&ts.turn_id, &ts.final_text));
    state.sessions.append_turn(&ts.session_id, &group).await;
    ts.committed = true;

    if input.output_mode.wants_audio() && !ts.final_text.is_empty() {
        audio::stream_speech(state, sink, cancel, &ts.final_text, input.voice.clone()).await?;
    }

    sink.send_terminal(AgentEvent::end(&ts.turn_id));
    Ok(Phase::Done)
}
