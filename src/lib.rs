//! # edgequake-taxforms
//!
//! Segment multi-page U.S. tax document packages and extract every form
//! instance into a schema-complete record using Vision Language Models.
//!
//! ## Why this crate?
//!
//! A partnership package is hundreds of pages: K-1s for dozens of partners,
//! a K-3 that runs for ten pages, withholding forms, blank instruction
//! copies. Sending all of it to a model is slow and expensive, and what
//! comes back drifts from one call to the next. This crate finds the form
//! pages with cheap local text heuristics, asks the model only about those,
//! and reconciles every answer with a versioned canonical schema so the
//! output has the same shape every time.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Input      validate path, sniff %PDF / PNG / JPEG
//!  ├─ 2. Classify   text signatures per page → form type
//!  ├─ 3. Ranges     contiguous same-type pages → form instances
//!  ├─ 4. Render     rasterise the pages of each range (pdfium, spawn_blocking)
//!  ├─ 5. Extract    Gemini / Groq / OpenAI / edgequake-llm / OCR with retry + fallback
//!  ├─ 6. Normalize  reconcile model JSON with the canonical schema
//!  └─ 7. Merge      one record per form instance, with page references
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_taxforms::{extract, Credentials, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ExtractionConfig::builder()
//!         .credentials(Credentials::from_env())
//!         .build()?;
//!     let output = extract("k1-package.pdf", &config).await?;
//!     for record in &output.records {
//!         println!("{} pages {}", record.form_type, record.page_reference);
//!     }
//!     eprintln!("{} failed range(s)", output.failures.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `taxforms` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-taxforms = { version = "0.1", default-features = false }
//! ```
//!
//! ## Supported Forms
//!
//! | Form | Strategy |
//! |------|----------|
//! | Schedule K-1 (1065) | each page separately, grouped by partner |
//! | Schedule K-3 | every page, merged into one record |
//! | 8804, 8805 | first page of the range |
//! | W-2, 1099-INT, 1099-NEC, 1099-MISC | up to 10 pages per call |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod classify;
pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod forms;
pub mod history;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod ranges;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{
    AttemptOutcome, BackendFamily, BackendRegistry, BackendResponse, ExtractionAttempt,
    ExtractionBackend, ExtractionRequest,
};
pub use classify::{AmbiguityPolicy, Classification, Classifier, PageClassification};
pub use config::{Credentials, ExtractionConfig, ExtractionConfigBuilder};
pub use document::{Document, ImageDocument, InMemoryDocument, NamedDocument, PdfDocument};
pub use error::{BackendError, BackendErrorKind, ParseError, RangeError, TaxFormError};
pub use extract::{detect, extract, extract_document, extract_from_bytes, extract_sync, Detection};
pub use forms::{ExtractionStrategy, FormSchema, FormType, SchemaRegistry};
pub use history::{record_output, HistoryEntry, HistoryStore, JsonFileHistory, DEFAULT_HISTORY_LIMIT};
pub use output::{Diagnostic, ExtractionOutput, FormRecord, RangeFailure, UsageMetadata};
pub use pipeline::consolidate::is_empty_value;
pub use pipeline::extract::PipelineStage;
pub use pipeline::input::open_document;
pub use pipeline::normalize::{normalize, NormalizedForm};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use ranges::{detect_ranges, FormRange};
