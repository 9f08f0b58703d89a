//! OpenAI-compatible `/chat/completions` vision calls (OpenAI and Groq).

use super::{BackendFamily, BackendResponse, ExtractionBackend, ExtractionRequest};
use crate::error::{BackendError, TaxFormError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GROQ_DEFAULT_MODEL: &str = "meta-llama/llama-4-scout-17b-16e-instruct";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";

pub struct OpenAiCompatBackend {
    id: String,
    family: BackendFamily,
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatBackend {
    pub fn new(
        id: String,
        family: BackendFamily,
        base_url: impl Into<String>,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, TaxFormError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TaxFormError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            id,
            family,
            client,
            api_key,
            base_url: base_url.into(),
        })
    }

    pub fn groq(id: String, api_key: String, timeout: Duration) -> Result<Self, TaxFormError> {
        Self::new(id, BackendFamily::Groq, GROQ_BASE_URL, api_key, timeout)
    }

    pub fn openai(id: String, api_key: String, timeout: Duration) -> Result<Self, TaxFormError> {
        Self::new(id, BackendFamily::OpenAi, OPENAI_BASE_URL, api_key, timeout)
    }

    fn build_body(request: &ExtractionRequest) -> ChatCompletionRequest {
        let mut content = vec![ContentPart::Text {
            text: request.prompt.clone(),
        }];
        content.extend(request.images.iter().map(|img| ContentPart::ImageUrl {
            image_url: ImageUrl { url: img.data_url() },
        }));
        ChatCompletionRequest {
            model: request.model_id.clone(),
            messages: vec![Message {
                role: "user",
                content,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl ExtractionBackend for OpenAiCompatBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> BackendFamily {
        self.family
    }

    async fn generate(&self, request: &ExtractionRequest) -> Result<BackendResponse, BackendError> {
        debug!(
            "{}: {} image(s) → {}",
            self.id,
            request.images.len(),
            request.model_id
        );

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| BackendError::from_message(&self.id, e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::from_message(&self.id, e.to_string()))?;

        if !status.is_success() {
            return Err(BackendError::from_status(&self.id, status.as_u16(), &body));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            BackendError::fatal(&self.id, format!("unexpected response shape: {e}"))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if text.is_empty() {
            return Err(BackendError::fatal(&self.id, "empty completion"));
        }

        let usage = parsed.usage.unwrap_or_default();
        Ok(BackendResponse {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

// ── Chat completion request/response types ───────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}
