//! Vision backends and the retry/fallback chain that drives them.
//!
//! A backend turns page images plus a prompt into model text. Concrete
//! backends:
//!
//! | Backend | Family | Transport |
//! |---------|--------|-----------|
//! | [`gemini::GeminiBackend`] | Gemini | `generateContent` REST via reqwest |
//! | [`openai::OpenAiCompatBackend`] | Groq, OpenAI | `/chat/completions` REST via reqwest |
//! | [`provider::ProviderBackend`] | Provider | any `edgequake_llm::LLMProvider` |
//! | [`ocr::OcrBackend`] | LocalOcr | `tesseract` + regex field capture |
//!
//! ## Fallback chain
//!
//! [`BackendRegistry::select`] orders candidates for a model id:
//!
//! ```text
//! primary family, key 1 ─▶ primary family, key 2 ─▶ other vision families ─▶ local OCR
//! ```
//!
//! Each candidate is retried with the registry's [`BackoffPolicy`]. A
//! candidate that stays transient moves the chain on; a fatal error ends
//! it, because a rejected request or a bad key will not be fixed by asking
//! a different model the same thing.

pub mod gemini;
pub mod ocr;
pub mod openai;
pub mod provider;

use crate::config::{Credentials, ExtractionConfig};
use crate::error::{BackendError, RangeError, TaxFormError};
use crate::forms::{FormSchema, FormType};
use crate::pipeline::encode::PageImage;
use crate::pipeline::retry::{BackoffPolicy, Sleeper, TokioSleeper};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Request / response ───────────────────────────────────────────────────

/// One call's worth of work for a backend.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub form_type: FormType,
    pub schema: Arc<FormSchema>,
    /// One or more rendered pages, in page order.
    pub images: Vec<PageImage>,
    pub prompt: String,
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl ExtractionRequest {
    /// Copy of the request addressed to a different model.
    pub fn with_model(&self, model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..self.clone()
        }
    }

    pub fn pages(&self) -> Vec<usize> {
        self.images.iter().map(|i| i.page).collect()
    }
}

/// What a backend returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendResponse {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Backend capability group. Keys of the same family are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFamily {
    Gemini,
    Groq,
    OpenAi,
    /// An edgequake-llm provider (OpenAI, Anthropic, Ollama, …).
    Provider,
    LocalOcr,
}

impl BackendFamily {
    /// Family serving `model_id`, by substring.
    pub fn from_model(model_id: &str) -> Option<Self> {
        let m = model_id.to_ascii_lowercase();
        if m.contains("gemini") {
            Some(BackendFamily::Gemini)
        } else if m.contains("llama") {
            Some(BackendFamily::Groq)
        } else if m.contains("gpt") {
            Some(BackendFamily::OpenAi)
        } else {
            None
        }
    }

    /// Model used when this family stands in for another during fallback.
    pub fn default_model(self) -> Option<&'static str> {
        match self {
            BackendFamily::Gemini => Some(gemini::DEFAULT_MODEL),
            BackendFamily::Groq => Some(openai::GROQ_DEFAULT_MODEL),
            BackendFamily::OpenAi => Some(openai::OPENAI_DEFAULT_MODEL),
            BackendFamily::Provider | BackendFamily::LocalOcr => None,
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendFamily::Gemini => "gemini",
            BackendFamily::Groq => "groq",
            BackendFamily::OpenAi => "openai",
            BackendFamily::Provider => "provider",
            BackendFamily::LocalOcr => "local-ocr",
        };
        f.write_str(s)
    }
}

/// A vision model endpoint.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Stable identifier used in logs and attempt records, e.g. `groq#2`.
    fn id(&self) -> &str;
    fn family(&self) -> BackendFamily;
    async fn generate(&self, request: &ExtractionRequest) -> Result<BackendResponse, BackendError>;
}

/// `"gemini"` for the first key of a family, `"gemini#2"` for the second.
pub(crate) fn backend_id(family: BackendFamily, index: usize) -> String {
    if index == 0 {
        family.to_string()
    } else {
        format!("{}#{}", family, index + 1)
    }
}

// ── Attempt records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientError,
    FatalError,
}

/// One call to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub backend_id: String,
    pub model_id: String,
    /// 1-based attempt number against this backend.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of walking the fallback chain for one request.
#[derive(Debug)]
pub struct ChainOutcome {
    pub result: Result<BackendResponse, RangeError>,
    /// Model that produced the successful response.
    pub model_id: Option<String>,
    pub attempts: Vec<ExtractionAttempt>,
}

impl ChainOutcome {
    pub fn api_calls(&self) -> usize {
        self.attempts.len()
    }
}

/// A backend paired with the model it should be asked for.
#[derive(Clone)]
pub struct Candidate {
    pub backend: Arc<dyn ExtractionBackend>,
    pub model_id: String,
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("backend", &self.backend.id())
            .field("model_id", &self.model_id)
            .finish()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Every configured backend, built once per run and shared by reference.
pub struct BackendRegistry {
    backends: Vec<Arc<dyn ExtractionBackend>>,
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    cross_family_fallback: bool,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.ids())
            .field("policy", &self.policy)
            .field("cross_family_fallback", &self.cross_family_fallback)
            .finish()
    }
}

impl BackendRegistry {
    /// An empty registry using real sleeps.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            backends: Vec::new(),
            policy,
            sleeper: Arc::new(TokioSleeper),
            cross_family_fallback: true,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ExtractionBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn cross_family_fallback(mut self, enabled: bool) -> Self {
        self.cross_family_fallback = enabled;
        self
    }

    /// Build the registry from configured credentials.
    ///
    /// Registration order is the fallback order among families: Gemini,
    /// Groq, OpenAI, edgequake-llm provider, local OCR.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, TaxFormError> {
        let policy = config.backoff_policy();
        let mut registry = Self::new(policy).cross_family_fallback(config.cross_family_fallback);
        let creds: &Credentials = &config.credentials;
        let timeout = Duration::from_secs(config.api_timeout_secs);

        for (i, key) in creds.gemini.iter().enumerate() {
            registry = registry.with_backend(Arc::new(gemini::GeminiBackend::new(
                backend_id(BackendFamily::Gemini, i),
                key.clone(),
                timeout,
            )?));
        }
        for (i, key) in creds.groq.iter().enumerate() {
            registry = registry.with_backend(Arc::new(openai::OpenAiCompatBackend::groq(
                backend_id(BackendFamily::Groq, i),
                key.clone(),
                timeout,
            )?));
        }
        for (i, key) in creds.openai.iter().enumerate() {
            registry = registry.with_backend(Arc::new(openai::OpenAiCompatBackend::openai(
                backend_id(BackendFamily::OpenAi, i),
                key.clone(),
                timeout,
            )?));
        }
        if let Some(backend) = provider::ProviderBackend::from_config(config)? {
            registry = registry.with_backend(Arc::new(backend));
        }
        if config.ocr_fallback {
            registry = registry.with_backend(Arc::new(ocr::OcrBackend::new()));
        }

        info!("Backends configured: {}", registry.ids().join(", "));
        Ok(registry)
    }

    pub fn ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Ordered candidates for `model_id`.
    ///
    /// An id naming no known family is handed to the edgequake-llm provider
    /// first, when one is configured.
    pub fn select(&self, model_id: &str) -> Vec<Candidate> {
        let primary = BackendFamily::from_model(model_id).unwrap_or(BackendFamily::Provider);
        let mut chain: Vec<Candidate> = self
            .backends
            .iter()
            .filter(|b| b.family() == primary)
            .map(|b| Candidate {
                backend: Arc::clone(b),
                model_id: model_id.to_string(),
            })
            .collect();

        if self.cross_family_fallback {
            for b in &self.backends {
                let family = b.family();
                if family == primary || family == BackendFamily::LocalOcr {
                    continue;
                }
                let model = family.default_model().unwrap_or(model_id);
                chain.push(Candidate {
                    backend: Arc::clone(b),
                    model_id: model.to_string(),
                });
            }
        }

        if primary != BackendFamily::LocalOcr {
            for b in self
                .backends
                .iter()
                .filter(|b| b.family() == BackendFamily::LocalOcr)
            {
                chain.push(Candidate {
                    backend: Arc::clone(b),
                    model_id: "tesseract".to_string(),
                });
            }
        }

        debug!(
            "Fallback chain for {}: {:?}",
            model_id,
            chain.iter().map(|c| c.backend.id()).collect::<Vec<_>>()
        );
        chain
    }

    /// Run `request` through the fallback chain for its model.
    pub async fn run_chain(&self, request: &ExtractionRequest) -> ChainOutcome {
        let chain = self.select(&request.model_id);
        let mut attempts = Vec::new();

        if chain.is_empty() {
            return ChainOutcome {
                result: Err(RangeError::NoBackend {
                    detail: format!(
                        "no backend configured for model '{}'; set GEMINI_API_KEY, GROQ_API_KEY or OPENAI_API_KEY",
                        request.model_id
                    ),
                }),
                model_id: None,
                attempts,
            };
        }

        let mut total_attempts = 0;
        let mut last_error: Option<BackendError> = None;

        for (position, candidate) in chain.iter().enumerate() {
            if position > 0 {
                warn!(
                    "Falling back to {} ({})",
                    candidate.backend.id(),
                    candidate.model_id
                );
            }
            let req = request.with_model(&candidate.model_id);
            let backend = Arc::clone(&candidate.backend);
            let label = format!("{} pages {:?}", backend.id(), req.pages());

            let retried = self
                .policy
                .run(
                    self.sleeper.as_ref(),
                    &label,
                    || backend.generate(&req),
                    |n, result| {
                        attempts.push(ExtractionAttempt {
                            backend_id: candidate.backend.id().to_string(),
                            model_id: candidate.model_id.clone(),
                            attempt_number: n,
                            outcome: match result {
                                Ok(_) => AttemptOutcome::Success,
                                Err(e) if e.is_transient() => AttemptOutcome::TransientError,
                                Err(_) => AttemptOutcome::FatalError,
                            },
                            detail: result.as_ref().err().map(|e| e.to_string()),
                        })
                    },
                )
                .await;
            total_attempts += retried.attempts;

            match retried.result {
                Ok(response) => {
                    debug!(
                        "{}: {} input tokens, {} output tokens",
                        candidate.backend.id(),
                        response.input_tokens,
                        response.output_tokens
                    );
                    return ChainOutcome {
                        result: Ok(response),
                        model_id: Some(candidate.model_id.clone()),
                        attempts,
                    };
                }
                Err(e) if e.is_transient() => {
                    warn!("{} exhausted after {} attempts: {}", e.backend, retried.attempts, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    // Not retried, but the next candidate may still serve the call.
                    warn!("{} unavailable: {}", e.backend, e);
                    last_error = Some(e);
                }
            }
        }

        let result = match last_error {
            Some(e) if !e.is_transient() => Err(RangeError::BackendFatal {
                detail: e.to_string(),
            }),
            last => Err(RangeError::BackendTransient {
                attempts: total_attempts,
                detail: last
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "all backends unavailable".into()),
            }),
        };
        ChainOutcome {
            result,
            model_id: None,
            attempts,
        }
    }
}
