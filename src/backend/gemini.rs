//! Google Gemini via the `generateContent` REST endpoint.

use super::{BackendFamily, BackendResponse, ExtractionBackend, ExtractionRequest};
use crate::error::{BackendError, TaxFormError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiBackend {
    id: String,
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(id: String, api_key: String, timeout: Duration) -> Result<Self, TaxFormError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TaxFormError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            id,
            client,
            api_key,
            base_url: API_BASE.to_string(),
        })
    }

    /// Point at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(request: &ExtractionRequest) -> GenerateRequest {
        let mut parts = vec![Part::Text {
            text: request.prompt.clone(),
        }];
        parts.extend(request.images.iter().map(|img| Part::InlineData {
            inline_data: InlineData {
                mime_type: img.mime_type.to_string(),
                data: img.data_b64.clone(),
            },
        }));
        GenerateRequest {
            contents: vec![Content { parts }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }
}

#[async_trait]
impl ExtractionBackend for GeminiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::Gemini
    }

    async fn generate(&self, request: &ExtractionRequest) -> Result<BackendResponse, BackendError> {
        let url = format!("{}/{}:generateContent", self.base_url, request.model_id);
        debug!(
            "{}: {} image(s) → {}",
            self.id,
            request.images.len(),
            request.model_id
        );

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
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

        let parsed: GenerateResponse = serde_json::from_str(&body).map_err(|e| {
            BackendError::fatal(&self.id, format!("unexpected response shape: {e}"))
        })?;
        parsed.into_backend_response(&self.id)
    }
}

// ── Gemini API request/response types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: usize,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: usize,
}

impl GenerateResponse {
    fn into_backend_response(self, backend: &str) -> Result<BackendResponse, BackendError> {
        let text: String = self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.is_empty() {
            let reason = self
                .prompt_feedback
                .map(|f| f.to_string())
                .unwrap_or_else(|| "no candidates".into());
            return Err(BackendError::fatal(backend, format!("empty response: {reason}")));
        }

        let usage = self.usage_metadata.unwrap_or(UsageMetadata {
            prompt_token_count: 0,
            candidates_token_count: 0,
        });
        Ok(BackendResponse {
            text,
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::{FormType, SchemaRegistry};
    use crate::pipeline::encode::PageImage;

    #[test]
    fn request_body_shape() {
        let request = ExtractionRequest {
            form_type: FormType::W2,
            schema: SchemaRegistry::embedded().unwrap().get(FormType::W2).unwrap(),
            images: vec![PageImage {
                page: 1,
                data_b64: "AAAA".into(),
                mime_type: "image/png",
            }],
            prompt: "extract".into(),
            model_id: DEFAULT_MODEL.into(),
            temperature: 0.1,
            max_tokens: 4096,
        };
        let body = serde_json::to_value(GeminiBackend::build_body(&request)).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "extract");
        assert_eq!(
            body["contents"][0]["parts"][1]["inline_data"]["mime_type"],
            "image/png"
        );
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 4096);
    }

    #[test]
    fn response_text_and_usage() {
        let json = r#"{
            "candidates": [{ "content": { "parts": [{ "text": "{\"a\":" }, { "text": "1}" }] } }],
            "usageMetadata": { "promptTokenCount": 1200, "candidatesTokenCount": 80 }
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(json).unwrap();
        let resp = parsed.into_backend_response("gemini").unwrap();
        assert_eq!(resp.text, "{\"a\":1}");
        assert_eq!(resp.input_tokens, 1200);
        assert_eq!(resp.output_tokens, 80);
    }

    #[test]
    fn blocked_response_is_fatal() {
        let json = r#"{ "promptFeedback": { "blockReason": "SAFETY" } }"#;
        let parsed: GenerateResponse = serde_json::from_str(json).unwrap();
        let err = parsed.into_backend_response("gemini").unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message.contains("SAFETY"));
    }
}
