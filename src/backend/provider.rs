//! Any edgequake-llm provider as an extraction backend.
//!
//! The vendor REST backends cover the three families the fallback chain
//! knows by name. Everything else (Anthropic, Azure, Ollama, a caller-built
//! provider with custom middleware) goes through this adapter, which maps
//! the request onto an edgequake-llm vision chat.
//!
//! ## Message Layout
//!
//! 1. **System message**: the extraction prompt
//! 2. **User message**: every page image, in page order, with empty text

use super::{BackendFamily, BackendResponse, ExtractionBackend, ExtractionRequest};
use crate::config::ExtractionConfig;
use crate::error::{BackendError, TaxFormError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::debug;

pub struct ProviderBackend {
    id: String,
    provider: Arc<dyn LLMProvider>,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            id: BackendFamily::Provider.to_string(),
            provider,
        }
    }

    /// Resolve the provider from most-specific to least-specific:
    ///
    /// 1. **Pre-built provider** (`config.provider`), used as-is.
    /// 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
    ///    created through [`ProviderFactory::create_llm_provider`].
    ///
    /// Returns `Ok(None)` when neither is configured; the vendor backends
    /// and OCR then make up the whole chain.
    pub fn from_config(config: &ExtractionConfig) -> Result<Option<Self>, TaxFormError> {
        if let Some(ref provider) = config.provider {
            return Ok(Some(Self::new(Arc::clone(provider))));
        }

        let creds = &config.credentials;
        if let (Some(name), Some(model)) = (&creds.llm_provider, &creds.llm_model) {
            let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
                TaxFormError::NoBackendAvailable {
                    model: model.clone(),
                    hint: format!("edgequake-llm provider '{name}' could not be created: {e}"),
                }
            })?;
            return Ok(Some(Self::new(provider)));
        }

        Ok(None)
    }

    fn build_messages(request: &ExtractionRequest) -> Vec<ChatMessage> {
        let images = request
            .images
            .iter()
            .map(|img| ImageData::new(img.data_b64.clone(), img.mime_type).with_detail("high"))
            .collect();
        vec![
            ChatMessage::system(request.prompt.as_str()),
            ChatMessage::user_with_images("", images),
        ]
    }
}

/// Build `CompletionOptions` from the request.
fn build_options(request: &ExtractionRequest) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(request.temperature),
        max_tokens: Some(request.max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl ExtractionBackend for ProviderBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::Provider
    }

    async fn generate(&self, request: &ExtractionRequest) -> Result<BackendResponse, BackendError> {
        let messages = Self::build_messages(request);
        let options = build_options(request);

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| BackendError::from_message(&self.id, format!("{}", e)))?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.id, response.prompt_tokens, response.completion_tokens
        );

        Ok(BackendResponse {
            text: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::{FormType, SchemaRegistry};

    #[test]
    fn build_options_follow_request() {
        let request = ExtractionRequest {
            form_type: FormType::Form8805,
            schema: SchemaRegistry::embedded()
                .unwrap()
                .get(FormType::Form8805)
                .unwrap(),
            images: Vec::new(),
            prompt: "p".into(),
            model_id: "claude-sonnet-4".into(),
            temperature: 0.1,
            max_tokens: 4096,
        };
        let opts = build_options(&request);
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(4096));
        assert_eq!(ProviderBackend::build_messages(&request).len(), 2);
    }
}
