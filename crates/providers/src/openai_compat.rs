//! OpenAI-compatible chat adapter.
//!
//! Works against OpenAI, Azure-style gateways, Ollama, vLLM, and any other
//! endpoint following the OpenAI chat completions contract. Vendor quirks are
//! absorbed here: sampling parameters are stripped for models that reject
//! them, and streamed tool-call fragments are assembled per call id so the
//! orchestrator only ever sees complete calls.

use serde_json::Value;
use std::collections::BTreeMap;

use vx_domain::capability::LlmCapabilities;
use vx_domain::config::ProviderConfig;
use vx_domain::error::{Error, Result};
use vx_domain::message::{Message, Role, ToolCall, ToolDefinition};
use vx_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::retry::{from_reqwest, from_status};
use crate::sse::sse_event_stream;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider, ToolChoice};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    /// Models whose requests must not carry sampling parameters.
    no_sampling_models: Vec<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ProviderConfig, request_timeout_secs: u64) -> Result<Self> {
        let api_key = match &cfg.api_key_env {
            Some(var) => {
                let key = std::env::var(var).ok().filter(|v| !v.is_empty());
                if key.is_none() {
                    tracing::warn!(
                        provider_id = %cfg.id,
                        env_var = %var,
                        "API key env var unset; requests will go out unauthenticated"
                    );
                }
                key
            }
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| from_reqwest("llm", e))?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.default_model.clone(),
            no_sampling_models: cfg.no_sampling_models.clone(),
            client,
        })
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let model = self.effective_model(req);
        let caps = self.capabilities(&model);

        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() && req.tool_choice != ToolChoice::None {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
            match &req.tool_choice {
                ToolChoice::Required => body["tool_choice"] = Value::String("required".into()),
                ToolChoice::Named(name) => {
                    body["tool_choice"] = serde_json::json!({
                        "type": "function",
                        "function": { "name": name },
                    });
                }
                _ => {}
            }
        }

        // Sampling parameters are dropped for models that reject them.
        if caps.supports_sampling_params {
            if let Some(temp) = req.temperature {
                body["temperature"] = serde_json::json!(temp);
            }
            if !req.stop.is_empty() {
                body["stop"] = serde_json::json!(req.stop);
            }
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.content,
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
                "tool_calls": calls,
            })
        }
        _ => serde_json::json!({
            "role": role_str(msg.role),
            "content": msg.content,
        }),
    }
}

fn tool_to_wire(def: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters,
        }
    })
}

/// Parse a tool-call arguments string, tolerating the empty-arguments quirk
/// some vendors exhibit.
fn parse_args(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "tool call arguments are not valid JSON; using empty object");
        Value::Object(Default::default())
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let usage = v.get("usage")?;
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: usage.get("completion_tokens").and_then(|t| t.as_u64()).unwrap_or(0)
            as u32,
        total_tokens: usage.get("total_tokens").and_then(|t| t.as_u64()).unwrap_or(0) as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembly state across streamed payloads.
///
/// Tool-call fragments arrive keyed by choice index; complete calls are only
/// released at the finish marker so downstream never sees a partial call.
#[derive(Default)]
struct StreamState {
    /// index -> (call_id, name, args buffer)
    pending: BTreeMap<u64, (String, String, String)>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    done_emitted: bool,
}

impl StreamState {
    /// Release assembled calls followed by the Done marker.
    fn flush(&mut self) -> Vec<Result<StreamEvent>> {
        if self.done_emitted {
            return Vec::new();
        }
        self.done_emitted = true;

        let mut events: Vec<Result<StreamEvent>> = Vec::new();
        for (_, (call_id, name, args)) in std::mem::take(&mut self.pending) {
            events.push(Ok(StreamEvent::ToolCallFinished {
                call_id,
                tool_name: name,
                arguments: parse_args(&args),
            }));
        }
        events.push(Ok(StreamEvent::Done {
            usage: self.usage.take(),
            finish_reason: self.finish_reason.take().or_else(|| Some("stop".into())),
        }));
        events
    }
}

/// Parse one SSE `data:` payload from an OpenAI-style stream.
fn parse_stream_data(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    if data == "[DONE]" {
        return state.flush();
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::from(e))],
    };

    if let Some(u) = parse_usage(&v) {
        state.usage = Some(u);
    }

    let mut events = Vec::new();
    let Some(choice) = v.get("choices").and_then(|c| c.get(0)) else {
        return events;
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token { text: text.to_string() }));
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let entry = state.pending.entry(index).or_default();

                if let Some(id) = call.get("id").and_then(|i| i.as_str()) {
                    entry.0 = id.to_string();
                }
                if let Some(func) = call.get("function") {
                    if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                        if entry.1.is_empty() {
                            entry.1 = name.to_string();
                            events.push(Ok(StreamEvent::ToolCallStarted {
                                call_id: entry.0.clone(),
                                tool_name: name.to_string(),
                            }));
                        }
                    }
                    if let Some(args) = func.get("arguments").and_then(|a| a.as_str()) {
                        entry.2.push_str(args);
                        if !args.is_empty() {
                            events.push(Ok(StreamEvent::ToolCallDelta {
                                call_id: entry.0.clone(),
                                delta: args.to_string(),
                            }));
                        }
                    }
                }
            }
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        state.finish_reason = Some(reason.to_string());
        events.extend(state.flush());
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmProvider impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, false);

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| from_reqwest("llm", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(from_status("llm", status, &text));
        }

        let v: Value = resp.json().await.map_err(|e| from_reqwest("llm", e))?;
        let usage = parse_usage(&v);
        let model = v
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.effective_model(&req))
            .to_string();

        let message = v
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| Error::unavailable("llm", "response has no choices"))?;

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();

        let tool_calls = message
            .get("tool_calls")
            .and_then(|c| c.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let func = call.get("function")?;
                        Some(ToolCall {
                            id: call.get("id").and_then(|i| i.as_str()).unwrap_or("").to_string(),
                            name: func.get("name")?.as_str()?.to_string(),
                            arguments: parse_args(
                                func.get("arguments").and_then(|a| a.as_str()).unwrap_or(""),
                            ),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let finish_reason = v
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(|r| r.as_str())
            .map(String::from);

        Ok(ChatResponse {
            content,
            tool_calls,
            usage,
            model,
            finish_reason,
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, true);

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| from_reqwest("llm", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(from_status("llm", status, &text));
        }

        let mut state = StreamState::default();
        Ok(sse_event_stream(resp, move |data| {
            parse_stream_data(data, &mut state)
        }))
    }

    fn capabilities(&self, model: &str) -> LlmCapabilities {
        LlmCapabilities {
            supports_sampling_params: !self.no_sampling_models.iter().any(|m| m == model),
            ..LlmCapabilities::default()
        }
    }

    fn provider_id(&self) -> &str {
        &self.id
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider(no_sampling: Vec<String>) -> OpenAiCompatProvider {
        OpenAiCompatProvider::from_config(
            &ProviderConfig {
                id: "test".into(),
                base_url: "https://api.example.com/v1/".into(),
                api_key_env: None,
                default_model: "gpt-4o-mini".into(),
                no_sampling_models: no_sampling,
            },
            30,
        )
        .unwrap()
    }

    fn basic_request() -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user("t1", "hi")],
            temperature: Some(0.3),
            stop: vec!["END".into()],
            ..Default::default()
        }
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let p = test_provider(vec![]);
        assert_eq!(p.base_url, "https://api.example.com/v1");
    }

    #[test]
    fn body_carries_sampling_params_by_default() {
        let p = test_provider(vec![]);
        let body = p.build_chat_body(&basic_request(), false);
        assert_eq!(body["temperature"], serde_json::json!(0.3));
        assert_eq!(body["stop"], serde_json::json!(["END"]));
    }

    #[test]
    fn sampling_params_stripped_for_restricted_model() {
        let p = test_provider(vec!["gpt-4o-mini".into()]);
        let body = p.build_chat_body(&basic_request(), false);
        assert!(body.get("temperature").is_none());
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn named_tool_choice_maps_to_function_object() {
        let p = test_provider(vec![]);
        let mut req = basic_request();
        req.tools = vec![ToolDefinition {
            name: "web_search".into(),
            description: "search".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        req.tool_choice = ToolChoice::Named("web_search".into());
        let body = p.build_chat_body(&req, false);
        assert_eq!(body["tool_choice"]["function"]["name"], "web_search");
    }

    #[test]
    fn tool_choice_none_omits_tools() {
        let p = test_provider(vec![]);
        let mut req = basic_request();
        req.tools = vec![ToolDefinition {
            name: "web_search".into(),
            description: "search".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        req.tool_choice = ToolChoice::None;
        let body = p.build_chat_body(&req, false);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn tool_message_maps_to_wire() {
        let wire = msg_to_wire(&Message::tool("t1", "call-1", "42"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call-1");
        assert_eq!(wire["content"], "42");
    }

    #[test]
    fn assistant_with_tool_calls_serializes_arguments_as_string() {
        let msg = Message::assistant_tool_calls(
            "t1",
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "get_time".into(),
                arguments: serde_json::json!({"zone": "UTC"}),
            }],
        );
        let wire = msg_to_wire(&msg);
        assert_eq!(wire["content"], Value::Null);
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn stream_tokens_in_order() {
        let mut state = StreamState::default();
        let events = parse_stream_data(
            r#"{"choices":[{"delta":{"content":"hel"}}]}"#,
            &mut state,
        );
        assert!(matches!(
            events.first(),
            Some(Ok(StreamEvent::Token { text })) if text == "hel"
        ));
    }

    #[test]
    fn stream_tool_calls_released_only_at_finish() {
        let mut state = StreamState::default();
        let chunks = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"web_search","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"query\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"news\"}"}}]}}]}"#,
        ];
        let mut all = Vec::new();
        for chunk in chunks {
            all.extend(parse_stream_data(chunk, &mut state));
        }
        // Started + two deltas, but no Finished yet.
        assert!(all
            .iter()
            .all(|e| !matches!(e, Ok(StreamEvent::ToolCallFinished { .. }))));

        let finish = parse_stream_data(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            &mut state,
        );
        let finished = finish
            .iter()
            .find_map(|e| match e {
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }) => Some((call_id.clone(), tool_name.clone(), arguments.clone())),
                _ => None,
            })
            .expect("tool call finished at finish marker");
        assert_eq!(finished.0, "c1");
        assert_eq!(finished.1, "web_search");
        assert_eq!(finished.2, serde_json::json!({"query": "news"}));
        assert!(matches!(finish.last(), Some(Ok(StreamEvent::Done { .. }))));
    }

    #[test]
    fn done_sentinel_flushes_once() {
        let mut state = StreamState::default();
        let first = parse_stream_data("[DONE]", &mut state);
        assert!(matches!(first.last(), Some(Ok(StreamEvent::Done { .. }))));
        assert!(parse_stream_data("[DONE]", &mut state).is_empty());
    }

    #[test]
    fn empty_arguments_default_to_object() {
        assert_eq!(parse_args(""), serde_json::json!({}));
        assert_eq!(parse_args("not json"), serde_json::json!({}));
        assert_eq!(parse_args(r#"{"a":1}"#), serde_json::json!({"a":1}));
    }

    #[test]
    fn usage_parsed_from_stream_payload() {
        let mut state = StreamState::default();
        parse_stream_data(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            &mut state,
        );
        let done = parse_stream_data("[DONE]", &mut state);
        match done.last() {
            Some(Ok(StreamEvent::Done { usage: Some(u), .. })) => {
                assert_eq!(u.prompt_tokens, 10);
                assert_eq!(u.total_tokens, 15);
            }
            other => panic!("expected Done with usage, got {other:?}"),
        }
    }
}
