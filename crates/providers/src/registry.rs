//! Provider registry.
//!
//! Constructs all configured LLM provider instances at startup and holds them
//! behind trait objects. Initialization failures are recorded rather than
//! aborting startup (subject to the configured startup policy), so operators
//! can diagnose a missing API key without scraping logs.

use std::collections::HashMap;
use std::sync::Arc;

use vx_domain::config::{LlmConfig, LlmStartupPolicy};
use vx_domain::error::{Error, Result};

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// Records a provider that failed to initialize.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_id: String,
    /// Error message with anything key-shaped masked.
    pub error: String,
}

/// Mask substrings that look like API keys or bearer tokens so secrets never
/// leak into logs or readiness endpoints.
fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..]);
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

/// Holds all instantiated LLM providers.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_id: Option<String>,
    init_errors: Vec<ProviderInitError>,
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`].
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        let mut init_errors = Vec::new();

        for pc in &config.providers {
            match OpenAiCompatProvider::from_config(pc, config.request_timeout_secs) {
                Ok(provider) => {
                    tracing::info!(provider_id = %pc.id, base_url = %pc.base_url, "registered LLM provider");
                    providers.insert(pc.id.clone(), Arc::new(provider));
                }
                Err(e) => {
                    let safe_error = mask_secrets(&e.to_string());
                    tracing::warn!(
                        provider_id = %pc.id,
                        error = %safe_error,
                        "failed to initialize LLM provider, skipping"
                    );
                    init_errors.push(ProviderInitError {
                        provider_id: pc.id.clone(),
                        error: safe_error,
                    });
                }
            }
        }

        if providers.is_empty()
            && !config.providers.is_empty()
            && config.startup_policy == LlmStartupPolicy::RequireOne
        {
            return Err(Error::Internal(
                "all configured LLM providers failed to initialize (startup_policy = require_one)"
                    .into(),
            ));
        }

        let default_id = config
            .default_provider
            .clone()
            .or_else(|| config.providers.first().map(|p| p.id.clone()))
            .filter(|id| providers.contains_key(id));

        Ok(Self {
            providers,
            default_id,
            init_errors,
        })
    }

    /// Registry with a single pre-built provider. Used by tests and embedders.
    pub fn with_provider(provider: Arc<dyn LlmProvider>) -> Self {
        let id = provider.provider_id().to_string();
        let mut providers = HashMap::new();
        providers.insert(id.clone(), provider);
        Self {
            providers,
            default_id: Some(id),
            init_errors: Vec::new(),
        }
    }

    /// Look up a provider by its config id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    /// The provider used when a request names none.
    pub fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        self.default_id.as_deref().and_then(|id| self.get(id))
    }

    /// Resolve `"provider/model"` specs; a bare model goes to the default
    /// provider. Returns the provider and the model to request.
    pub fn resolve(&self, model_spec: Option<&str>) -> Option<(Arc<dyn LlmProvider>, String)> {
        match model_spec {
            Some(spec) => {
                if let Some((provider_id, model)) = spec.split_once('/') {
                    let provider = self.get(provider_id)?;
                    Some((provider, model.to_string()))
                } else {
                    let provider = self.default_provider()?;
                    Some((provider, spec.to_string()))
                }
            }
            None => {
                let provider = self.default_provider()?;
                let model = provider.default_model().to_string();
                Some((provider, model))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_secrets_hides_long_tokens() {
        let masked = mask_secrets("invalid key sk-abcdefghijklmnopqrstuvwxyz012345");
        assert!(!masked.contains("abcdefghijklmnop"));
        assert!(masked.contains("..."));
    }

    #[test]
    fn mask_secrets_keeps_short_words() {
        let msg = "connection refused to host";
        assert_eq!(mask_secrets(msg), msg);
    }

    #[test]
    fn empty_config_builds_empty_registry() {
        let registry = ProviderRegistry::from_config(&LlmConfig::default()).unwrap();
        assert!(registry.is_empty());
        assert!(registry.default_provider().is_none());
        assert!(registry.resolve(None).is_none());
    }

    #[test]
    fn resolve_splits_provider_model_spec() {
        let config = LlmConfig {
            providers: vec![vx_domain::config::ProviderConfig {
                id: "main".into(),
                base_url: "https://api.example.com/v1".into(),
                api_key_env: None,
                default_model: "gpt-4o-mini".into(),
                no_sampling_models: vec![],
            }],
            ..Default::default()
        };
        let registry = ProviderRegistry::from_config(&config).unwrap();

        let (provider, model) = registry.resolve(Some("main/gpt-4o")).unwrap();
        assert_eq!(provider.provider_id(), "main");
        assert_eq!(model, "gpt-4o");

        let (_, model) = registry.resolve(Some("o1-mini")).unwrap();
        assert_eq!(model, "o1-mini");

        let (_, model) = registry.resolve(None).unwrap();
        assert_eq!(model, "gpt-4o-mini");
    }
}
