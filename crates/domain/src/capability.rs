use serde::{Deserialize, Serialize};

/// Advertised capabilities of a {provider, model} pair.
///
/// Adapters consult this table to adapt vendor quirks: models with
/// `supports_sampling_params = false` have `temperature`/`stop` stripped
/// from outgoing requests instead of erroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCapabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    /// Whether the model accepts sampling parameters (temperature, stop).
    pub supports_sampling_params: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for LlmCapabilities {
    fn default() -> Self {
        Self {
            supports_tools: true,
            supports_streaming: true,
            supports_sampling_params: true,
            context_window_tokens: None,
            max_output_tokens: None,
        }
    }
}
