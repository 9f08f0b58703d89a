//! Configuration types for tax-form extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. API keys live in [`Credentials`],
//! which never prints its secrets.

use crate::classify::AmbiguityPolicy;
use crate::error::TaxFormError;
use crate::forms::FormType;
use crate::pipeline::retry::BackoffPolicy;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Largest number of page images sent in one backend call.
pub const MAX_BATCH_SIZE: usize = 10;

/// Configuration for one extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_taxforms::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .model("gpt-4o")
///     .concurrency(2)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Primary vision model. The substring picks the family: "gemini",
    /// "llama" (Groq) or "gpt" (OpenAI); anything else goes to the
    /// edgequake-llm provider. Default: `gemini-2.5-flash`.
    pub model: String,

    /// Form ranges processed at once. Default: 4.
    ///
    /// Pages inside a range are always sequential, so this is also the
    /// ceiling on concurrent backend calls.
    pub concurrency: usize,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 4096.
    pub max_tokens: usize,

    /// Attempts per backend before the chain moves on. Default: 3.
    pub max_retries: u32,

    /// Delay before the second attempt, in milliseconds. Default: 2000.
    pub retry_base_delay_ms: u64,

    /// Factor applied to the delay after each failed attempt. Default: 2.0.
    pub retry_multiplier: f64,

    /// Rasterisation scale relative to the page's natural size. Default: 2.0.
    pub render_scale: f32,

    /// Images per multi-image call for batch-strategy forms. Range 1–10. Default: 10.
    pub batch_size: usize,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Treat every page as this form type and skip signature detection.
    pub form_override: Option<FormType>,

    /// How pages matching several signatures are resolved. Default: precedence.
    pub ambiguity_policy: AmbiguityPolicy,

    /// Load schemas from this directory instead of the embedded set.
    pub schema_dir: Option<PathBuf>,

    /// Let other configured model families stand in once the primary
    /// family's keys are exhausted. Default: true.
    pub cross_family_fallback: bool,

    /// Append local `tesseract` OCR as the last link of the chain. Default: true.
    pub ocr_fallback: bool,

    /// Per-call HTTP timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// API keys and provider selection.
    pub credentials: Credentials,

    /// Pre-constructed edgequake-llm provider, added to the chain as-is.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Receives per-range events while extraction runs.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: crate::backend::gemini::DEFAULT_MODEL.to_string(),
            concurrency: 4,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            retry_multiplier: 2.0,
            render_scale: 2.0,
            batch_size: MAX_BATCH_SIZE,
            password: None,
            form_override: None,
            ambiguity_policy: AmbiguityPolicy::default(),
            schema_dir: None,
            cross_family_fallback: true,
            ocr_fallback: true,
            api_timeout_secs: 120,
            credentials: Credentials::default(),
            provider: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("model", &self.model)
            .field("concurrency", &self.concurrency)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("retry_multiplier", &self.retry_multiplier)
            .field("render_scale", &self.render_scale)
            .field("batch_size", &self.batch_size)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("form_override", &self.form_override)
            .field("ambiguity_policy", &self.ambiguity_policy)
            .field("schema_dir", &self.schema_dir)
            .field("cross_family_fallback", &self.cross_family_fallback)
            .field("ocr_fallback", &self.ocr_fallback)
            .field("credentials", &self.credentials)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Retry policy applied to every backend call.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_multiplier,
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.max(1);
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_delay_ms = ms;
        self
    }

    pub fn retry_multiplier(mut self, m: f64) -> Self {
        self.config.retry_multiplier = m.max(1.0);
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = scale.clamp(0.5, 6.0);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn form_override(mut self, form_type: FormType) -> Self {
        self.config.form_override = Some(form_type);
        self
    }

    pub fn ambiguity_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.config.ambiguity_policy = policy;
        self
    }

    pub fn schema_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.schema_dir = Some(dir.into());
        self
    }

    pub fn cross_family_fallback(mut self, v: bool) -> Self {
        self.config.cross_family_fallback = v;
        self
    }

    pub fn ocr_fallback(mut self, v: bool) -> Self {
        self.config.ocr_fallback = v;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = credentials;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, TaxFormError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(TaxFormError::InvalidConfig("Model id must not be empty".into()));
        }
        if c.concurrency == 0 {
            return Err(TaxFormError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&c.batch_size) {
            return Err(TaxFormError::InvalidConfig(format!(
                "Batch size must be 1–{MAX_BATCH_SIZE}, got {}",
                c.batch_size
            )));
        }
        if let Some(dir) = &c.schema_dir {
            if !dir.is_dir() {
                return Err(TaxFormError::InvalidConfig(format!(
                    "Schema directory '{}' does not exist",
                    dir.display()
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

/// API keys per backend family, primary key first.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub gemini: Vec<String>,
    pub groq: Vec<String>,
    pub openai: Vec<String>,
    /// edgequake-llm provider name (`EDGEQUAKE_LLM_PROVIDER`).
    pub llm_provider: Option<String>,
    /// edgequake-llm model (`EDGEQUAKE_MODEL`).
    pub llm_model: Option<String>,
}

impl Credentials {
    /// Read keys from the process environment.
    ///
    /// | Family | Variables |
    /// |--------|-----------|
    /// | Gemini | `GEMINI_API_KEY`, `GEMINI_API_KEY_2` |
    /// | Groq   | `GROQ_API_KEY`, `GROQ_API_KEY_2` |
    /// | OpenAI | `OPENAI_API_KEY`, `OPENAI_API_KEY_2` |
    /// | edgequake-llm | `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Credentials::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let pair = |base: &str| -> Vec<String> {
            [base.to_string(), format!("{base}_2")]
                .iter()
                .filter_map(|n| get(n))
                .collect()
        };
        Self {
            gemini: pair("GEMINI_API_KEY"),
            groq: pair("GROQ_API_KEY"),
            openai: pair("OPENAI_API_KEY"),
            llm_provider: get("EDGEQUAKE_LLM_PROVIDER"),
            llm_model: get("EDGEQUAKE_MODEL"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gemini.is_empty()
            && self.groq.is_empty()
            && self.openai.is_empty()
            && self.llm_provider.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("gemini", &format!("{} key(s)", self.gemini.len()))
            .field("groq", &format!("{} key(s)", self.groq.len()))
            .field("openai", &format!("{} key(s)", self.openai.len()))
            .field("llm_provider", &self.llm_provider)
            .field("llm_model", &self.llm_model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.model, "gemini-2.5-flash");
        assert_eq!(c.concurrency, 4);
        assert_eq!(c.batch_size, 10);
        assert_eq!(c.render_scale, 2.0);
        let policy = c.backoff_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn builder_clamps() {
        let c = ExtractionConfig::builder()
            .concurrency(0)
            .batch_size(50)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.batch_size, 10);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn missing_schema_dir_is_rejected() {
        let err = ExtractionConfig::builder()
            .schema_dir("/definitely/not/here")
            .build()
            .unwrap_err();
        assert!(matches!(err, TaxFormError::InvalidConfig(_)));
    }

    #[test]
    fn credentials_read_primary_and_secondary_keys() {
        let vars: HashMap<&str, &str> = [
            ("GROQ_API_KEY", "gsk-1"),
            ("GROQ_API_KEY_2", "gsk-2"),
            ("GEMINI_API_KEY", "  "),
            ("OPENAI_API_KEY_2", "sk-2"),
        ]
        .into_iter()
        .collect();
        let creds = Credentials::from_lookup(|n| vars.get(n).map(|v| v.to_string()));
        assert_eq!(creds.groq, vec!["gsk-1", "gsk-2"]);
        assert!(creds.gemini.is_empty());
        assert_eq!(creds.openai, vec!["sk-2"]);
        assert!(!creds.is_empty());
    }

    #[test]
    fn debug_never_prints_keys() {
        let creds = Credentials {
            gemini: vec!["AIza-secret".into()],
            ..Default::default()
        };
        let config = ExtractionConfig::builder()
            .credentials(creds)
            .password("hunter2")
            .build()
            .unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("AIza-secret"));
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("1 key(s)"));
    }
}
