use serde::{Deserialize, Serialize};

use vx_domain::capability::LlmCapabilities;
use vx_domain::error::Result;
use vx_domain::message::{Message, ToolCall, ToolDefinition};
use vx_domain::stream::{BoxStream, StreamEvent, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the model is allowed to use tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Model decides freely.
    #[default]
    Auto,
    /// Tools disabled for this request.
    None,
    /// Model must call some tool.
    Required,
    /// Model must call the named tool.
    Named(String),
}

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Model identifier. `None` uses the provider default.
    pub model: Option<String>,
    /// Sampling temperature. Stripped for models whose capability table says
    /// they reject sampling parameters.
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: ToolChoice,
    /// Stop sequences. Also subject to capability stripping.
    pub stop: Vec<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content (may be empty when tool calls are present).
    pub content: String,
    /// Tool calls emitted by the model, in generation order.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    /// Vendor finish reason (e.g. "stop", "tool_calls").
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements.
///
/// Implementations translate between these types and the vendor wire format,
/// hiding vendor quirks: models that reject sampling parameters have them
/// stripped (consulting the capability table), and tool-call delta streams
/// are aggregated per call id before a complete [`ToolCall`] is surfaced.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return an ordered event stream.
    ///
    /// Single-producer, consumed once, cancelled by dropping the stream.
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// Capability table entry for the given model.
    fn capabilities(&self, model: &str) -> LlmCapabilities;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;

    /// Model used when a request names none.
    fn default_model(&self) -> &str;
}
