//! Document-level extraction entry points.
//!
//! Classification and range detection run locally and up front. Each
//! detected range is then an independent unit of work; ranges run
//! concurrently and are re-sorted by start page afterwards.

use crate::backend::BackendRegistry;
use crate::classify::{classify, Classification, Classifier, PageClassification};
use crate::config::ExtractionConfig;
use crate::document::{Document, NamedDocument};
use crate::error::{RangeError, TaxFormError};
use crate::forms::SchemaRegistry;
use crate::output::{Diagnostic, ExtractionOutput, FormRecord, RangeFailure, UsageMetadata};
use crate::pipeline::consolidate::is_empty_value;
use crate::pipeline::extract::{extract_range, PipelineStage, RangeOutcome, RangeUsage};
use crate::pipeline::input;
use crate::ranges::{detect_ranges, FormRange};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Page classifications and the ranges built from them.
#[derive(Debug, Clone)]
pub struct Detection {
    pub pages: Vec<PageClassification>,
    pub ranges: Vec<FormRange>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Extract every supported tax form from a PDF or image file.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(ExtractionOutput)` whenever at least one form was detected, even if
/// some ranges failed (check `output.failures`).
///
/// # Errors
/// Returns `Err(TaxFormError)` only for fatal errors:
/// - File not found / permission denied / unsupported file
/// - Corrupt or encrypted PDF
/// - No supported form detected
/// - Schema registry or backend configuration problems
pub async fn extract(
    path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, TaxFormError> {
    let path = path.as_ref();
    info!("Starting extraction: {}", path.display());

    // ── Step 1: Open document ────────────────────────────────────────────
    let document = input::open_document(path, config.password.as_deref()).await?;
    info!(
        "{} has {} page(s){}",
        document.name(),
        document.page_count(),
        if document.is_digital() { "" } else { ", no text layer" }
    );

    // ── Step 2: Schemas and backends ─────────────────────────────────────
    let schemas = load_schemas(config)?;
    let backends = BackendRegistry::from_config(config)?;

    extract_document(document.as_ref(), config, &schemas, &backends).await
}

/// Extract from an in-memory upload. `filename` is the name reported in the
/// output and used for filename-based detection of pages without text.
pub async fn extract_from_bytes(
    bytes: &[u8],
    filename: &str,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, TaxFormError> {
    let (_spool, document) = open_upload(bytes, filename, config.password.as_deref()).await?;
    let schemas = load_schemas(config)?;
    let backends = BackendRegistry::from_config(config)?;
    extract_document(document.as_ref(), config, &schemas, &backends).await
}

/// Spool `bytes` to a temporary file and open it under `filename`. The file
/// lives as long as the returned handle.
async fn open_upload(
    bytes: &[u8],
    filename: &str,
    password: Option<&str>,
) -> Result<(NamedTempFile, Box<dyn Document>), TaxFormError> {
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    let kind = input::InputKind::from_magic(&magic).ok_or_else(|| TaxFormError::UnsupportedInput {
        path: filename.into(),
        magic,
    })?;

    // The image decoder picks its format from the extension.
    let mut spool = tempfile::Builder::new()
        .prefix("taxforms-")
        .suffix(&format!(".{}", kind.extension()))
        .tempfile()
        .map_err(|e| TaxFormError::Internal(format!("tempfile: {e}")))?;
    spool
        .write_all(bytes)
        .map_err(|e| TaxFormError::Internal(format!("tempfile write: {e}")))?;
    spool
        .flush()
        .map_err(|e| TaxFormError::Internal(format!("tempfile flush: {e}")))?;

    let inner = input::open_document(spool.path(), password).await?;
    let document: Box<dyn Document> = Box::new(NamedDocument::new(filename, inner));
    Ok((spool, document))
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime. Do not call from within an async
/// context; use [`extract`] instead.
pub fn extract_sync(
    path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, TaxFormError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| TaxFormError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(path, config))
}

/// The schema registry selected by `config`.
pub fn load_schemas(config: &ExtractionConfig) -> Result<SchemaRegistry, TaxFormError> {
    match &config.schema_dir {
        Some(dir) => SchemaRegistry::load_dir(dir),
        None => SchemaRegistry::embedded(),
    }
}

/// Classify every page and group the pages into form ranges.
pub fn detect(document: &dyn Document, config: &ExtractionConfig) -> Result<Detection, TaxFormError> {
    debug!("{}: {}", document.name(), PipelineStage::Detecting);
    let texts = (1..=document.page_count())
        .map(|p| document.page_text(p))
        .collect::<Result<Vec<&str>, _>>()?;

    let classifier = Classifier {
        policy: config.ambiguity_policy,
        form_override: config.form_override,
        ..Classifier::default()
    };
    let pages = classifier.classify_pages(&texts, document.name());
    let ranges = detect_ranges(&pages);

    let diagnostics = if config.form_override.is_some() {
        Vec::new()
    } else {
        ambiguity_diagnostics(&texts, &pages)
    };

    info!(
        "Detected {} form range(s): {}",
        ranges.len(),
        ranges
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(Detection {
        pages,
        ranges,
        diagnostics,
    })
}

/// Pages that matched several signatures, with what was made of them.
fn ambiguity_diagnostics(texts: &[&str], pages: &[PageClassification]) -> Vec<Diagnostic> {
    texts
        .iter()
        .zip(pages)
        .filter_map(|(text, page)| match classify(text) {
            Classification::Ambiguous { candidates, .. } => {
                Some(Diagnostic::AmbiguousClassification {
                    page: page.page,
                    candidates,
                    chosen: page.classification.form_type(),
                })
            }
            _ => None,
        })
        .collect()
}

/// Run detection and extraction over an open document.
///
/// Schemas and backends are passed in so callers (and tests) can supply
/// their own.
pub async fn extract_document(
    document: &dyn Document,
    config: &ExtractionConfig,
    schemas: &SchemaRegistry,
    backends: &BackendRegistry,
) -> Result<ExtractionOutput, TaxFormError> {
    let total_start = Instant::now();
    let mut usage = UsageMetadata::started(&config.model);

    // ── Step 1: Detect form ranges ───────────────────────────────────────
    let detection = detect(document, config)?;
    if detection.ranges.is_empty() {
        return Err(TaxFormError::NoFormsDetected {
            source_name: document.name().to_string(),
            pages: document.page_count(),
        });
    }
    if let Some(ref cb) = config.progress_callback {
        cb.on_detection_complete(&detection.ranges);
    }

    if backends.is_empty() {
        return Err(TaxFormError::NoBackendAvailable {
            model: config.model.clone(),
            hint: "Set GEMINI_API_KEY, GROQ_API_KEY or OPENAI_API_KEY, or enable the OCR fallback."
                .to_string(),
        });
    }

    // ── Step 2: Extract ranges concurrently ──────────────────────────────
    let llm_start = Instant::now();
    let mut outcomes: Vec<RangeOutcome> = stream::iter(detection.ranges.iter().map(|&range| async move {
        if let Some(ref cb) = config.progress_callback {
            cb.on_range_start(&range);
        }
        let outcome = match schemas.get(range.form_type) {
            Ok(schema) => extract_range(range, document, schema, backends, config).await,
            Err(e) => {
                warn!("{range}: {e}");
                RangeOutcome {
                    range,
                    stage: PipelineStage::Failed(range),
                    result: Err(RangeError::SchemaMissing {
                        form_type: range.form_type.to_string(),
                    }),
                    usage: RangeUsage::default(),
                    attempts: Vec::new(),
                    diagnostics: Vec::new(),
                }
            }
        };
        if let Some(ref cb) = config.progress_callback {
            match &outcome.result {
                Ok(records) => cb.on_range_complete(&range, records.len()),
                Err(e) => cb.on_range_error(&range, e),
            }
        }
        outcome
    }))
    .buffer_unordered(config.concurrency)
    .collect()
    .await;
    let llm_duration_ms = llm_start.elapsed().as_millis();

    // Sort by page for consistent output
    outcomes.sort_by_key(|o| o.range.start_page);

    // ── Step 3: Assemble output ──────────────────────────────────────────
    let mut records = Vec::new();
    let mut failures = Vec::new();
    let mut attempts = Vec::new();
    let mut diagnostics = detection.diagnostics;

    for outcome in outcomes {
        usage.add_tokens(outcome.usage.input_tokens, outcome.usage.output_tokens);
        usage.api_calls_made += outcome.usage.api_calls;
        usage.pages_processed += outcome.usage.pages_processed;
        attempts.extend(outcome.attempts);
        diagnostics.extend(outcome.diagnostics);
        match outcome.result {
            Ok(consolidated) => records.extend(
                consolidated
                    .into_iter()
                    .map(|c| FormRecord::from_normalized(c.form, c.page_reference)),
            ),
            Err(error) => failures.push(RangeFailure {
                range: outcome.range,
                error,
            }),
        }
    }

    let document_metadata = hoist_metadata(&records);
    usage.finish();

    let succeeded = detection.ranges.len() - failures.len();
    info!(
        "Extraction complete: {} record(s), {}/{} range(s), {} API call(s), {}ms backend / {}ms total",
        records.len(),
        succeeded,
        detection.ranges.len(),
        usage.api_calls_made,
        llm_duration_ms,
        total_start.elapsed().as_millis()
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_complete(detection.ranges.len(), succeeded);
    }

    Ok(ExtractionOutput {
        filename: document.name().to_string(),
        ranges: detection.ranges,
        records,
        failures,
        document_metadata,
        usage,
        attempts,
        diagnostics,
    })
}

/// First non-empty value of each metadata key, in record order.
fn hoist_metadata(records: &[FormRecord]) -> BTreeMap<String, Value> {
    let mut out: BTreeMap<String, Value> = BTreeMap::new();
    for record in records {
        for (key, value) in &record.document_metadata {
            let slot = out.entry(key.clone()).or_insert(Value::Null);
            if is_empty_value(slot) && !is_empty_value(value) {
                *slot = value.clone();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::AmbiguityPolicy;
    use crate::document::InMemoryDocument;
    use crate::forms::FormType;
    use serde_json::json;

    #[test]
    fn hoisting_takes_first_non_empty_value() {
        let schema = SchemaRegistry::embedded().unwrap().get(FormType::ScheduleK1).unwrap();
        let blank = crate::pipeline::normalize::NormalizedForm::empty(&schema);
        let mut a = FormRecord::from_normalized(blank.clone(), "1".into());
        let mut b = FormRecord::from_normalized(blank, "2".into());
        a.document_metadata.insert("tax_year".into(), Value::Null);
        b.document_metadata.insert("tax_year".into(), json!("2024"));
        let hoisted = hoist_metadata(&[a, b]);
        assert_eq!(hoisted["tax_year"], json!("2024"));
    }

    fn png_bytes() -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::new_rgb8(4, 4)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn uploads_are_detected_by_the_callers_filename() {
        let config = ExtractionConfig::default();

        let (spool, doc) = open_upload(&png_bytes(), "scan.png", None).await.unwrap();
        assert_eq!(doc.name(), "scan.png");
        assert!(!spool.path().to_string_lossy().contains("scan"));
        assert!(detect(doc.as_ref(), &config).unwrap().ranges.is_empty());

        let (_spool, doc) = open_upload(&png_bytes(), "W-2 2024.png", None).await.unwrap();
        assert_eq!(
            detect(doc.as_ref(), &config).unwrap().ranges,
            vec![FormRange::new(FormType::W2, 1, 1)]
        );
    }

    #[tokio::test]
    async fn upload_of_unknown_bytes_is_rejected() {
        let err = open_upload(b"PK\x03\x04zip", "w2.zip", None).await.err().unwrap();
        assert!(matches!(err, TaxFormError::UnsupportedInput { .. }));
    }

    #[test]
    fn detection_without_forms_is_empty() {
        let doc = InMemoryDocument::from_texts("notes.pdf", ["Meeting notes", "Agenda"]);
        let detection = detect(&doc, &ExtractionConfig::default()).unwrap();
        assert!(detection.ranges.is_empty());
        assert!(detection.diagnostics.is_empty());
    }

    #[test]
    fn override_forces_a_single_range() {
        let doc = InMemoryDocument::from_texts("scan.pdf", ["", "", ""]);
        let config = ExtractionConfig::builder()
            .form_override(FormType::W2)
            .ambiguity_policy(AmbiguityPolicy::Reject)
            .build()
            .unwrap();
        let detection = detect(&doc, &config).unwrap();
        assert_eq!(detection.ranges, vec![FormRange::new(FormType::W2, 1, 3)]);
    }

    #[tokio::test]
    async fn no_forms_is_a_fatal_error() {
        let doc = InMemoryDocument::from_texts("notes.pdf", ["nothing here"]);
        let config = ExtractionConfig::default();
        let backends = BackendRegistry::new(config.backoff_policy());
        let err = extract_document(&doc, &config, &SchemaRegistry::embedded().unwrap(), &backends)
            .await
            .unwrap_err();
        assert!(matches!(err, TaxFormError::NoFormsDetected { pages: 1, .. }));
    }
}
