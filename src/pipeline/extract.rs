//! Extraction of one detected form range.
//!
//! A range is worked through as a sequence of backend calls whose shape
//! depends on the form's [`ExtractionStrategy`]:
//!
//! | Strategy | Calls |
//! |----------|-------|
//! | `PerPage`, `MergeRange` | one per page, in page order |
//! | `FirstPage` | one, for the range's first page |
//! | `Batch` | one per chunk of at most `batch_size` pages |
//!
//! Each call renders its pages, encodes them, walks the backend fallback
//! chain, and normalises the response. Calls inside a range never overlap;
//! concurrency lives one level up, across ranges.
//!
//! ## Failure scoping
//!
//! A page that fails to render or a response that fails to parse is
//! reported as a [`Diagnostic`] and the range carries on with the pages it
//! has. A backend error ends the range: the chain has already retried and
//! fallen back, so the next page would meet the same wall. A range with no
//! usable page at all fails with the last error seen.

use crate::backend::{BackendRegistry, ExtractionAttempt, ExtractionRequest};
use crate::config::ExtractionConfig;
use crate::document::Document;
use crate::error::RangeError;
use crate::forms::{ExtractionStrategy, FormSchema};
use crate::output::Diagnostic;
use crate::pipeline::consolidate::{consolidate, Consolidated, PageResult};
use crate::pipeline::encode::{encode_page, PageImage};
use crate::pipeline::normalize::normalize;
use crate::prompts::extraction_prompt;
use crate::ranges::FormRange;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a document, or one range of it, is in the extraction.
///
/// ```text
/// Detecting → Rendering → Extracting → Normalizing → Consolidating → Done
/// ```
///
/// `Failed` is scoped to one range; its siblings continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Detecting,
    Rendering,
    Extracting,
    Normalizing,
    Consolidating,
    Done,
    Failed(FormRange),
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Detecting => f.write_str("detecting"),
            PipelineStage::Rendering => f.write_str("rendering"),
            PipelineStage::Extracting => f.write_str("extracting"),
            PipelineStage::Normalizing => f.write_str("normalizing"),
            PipelineStage::Consolidating => f.write_str("consolidating"),
            PipelineStage::Done => f.write_str("done"),
            PipelineStage::Failed(range) => write!(f, "failed ({range})"),
        }
    }
}

/// Token and call counts for one range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub api_calls: usize,
    pub pages_processed: usize,
}

/// Everything one range produced, successful or not.
#[derive(Debug)]
pub struct RangeOutcome {
    pub range: FormRange,
    /// `Done`, or `Failed` when the range produced no records.
    pub stage: PipelineStage,
    pub result: Result<Vec<Consolidated>, RangeError>,
    pub usage: RangeUsage,
    pub attempts: Vec<ExtractionAttempt>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Pages of `range` grouped into backend calls.
pub fn call_plan(range: &FormRange, strategy: ExtractionStrategy, batch_size: usize) -> Vec<Vec<usize>> {
    match strategy {
        ExtractionStrategy::PerPage | ExtractionStrategy::MergeRange => {
            range.pages().map(|p| vec![p]).collect()
        }
        ExtractionStrategy::FirstPage => vec![vec![range.start_page]],
        ExtractionStrategy::Batch => {
            let pages: Vec<usize> = range.pages().collect();
            pages
                .chunks(batch_size.max(1))
                .map(<[usize]>::to_vec)
                .collect()
        }
    }
}

/// Extract every record of `range`.
pub async fn extract_range(
    range: FormRange,
    document: &dyn Document,
    schema: Arc<FormSchema>,
    backends: &BackendRegistry,
    config: &ExtractionConfig,
) -> RangeOutcome {
    let start = Instant::now();
    let mut outcome = RangeOutcome {
        range,
        stage: PipelineStage::Rendering,
        result: Ok(Vec::new()),
        usage: RangeUsage::default(),
        attempts: Vec::new(),
        diagnostics: Vec::new(),
    };

    let plan = call_plan(&range, schema.strategy, config.batch_size);
    debug!("{range}: {} call(s) planned ({:?})", plan.len(), schema.strategy);

    let mut results: Vec<PageResult> = Vec::new();
    let mut last_error: Option<RangeError> = None;

    for pages in plan {
        // ── Render + encode ──────────────────────────────────────────────
        outcome.enter(PipelineStage::Rendering);
        let images = match render_and_encode(document, &pages, config.render_scale).await {
            Ok((images, failures)) => {
                for (page, detail) in failures {
                    warn!("{range}: page {page} skipped: {detail}");
                    last_error = Some(RangeError::RenderFailure {
                        page,
                        detail: detail.clone(),
                    });
                    outcome
                        .diagnostics
                        .push(Diagnostic::RenderFailure { page, detail });
                }
                images
            }
            Err(e) => return outcome.fail(e),
        };
        if images.is_empty() {
            continue;
        }
        let sent: Vec<usize> = images.iter().map(|i| i.page).collect();

        // ── Backend chain ────────────────────────────────────────────────
        outcome.enter(PipelineStage::Extracting);
        let request = ExtractionRequest {
            form_type: range.form_type,
            schema: Arc::clone(&schema),
            prompt: extraction_prompt(&schema, &sent),
            images,
            model_id: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };
        let chain = backends.run_chain(&request).await;
        outcome.usage.api_calls += chain.api_calls();
        if let Some(d) = fallback_diagnostic(&sent, &config.model, &chain.attempts) {
            outcome.diagnostics.push(d);
        }
        outcome.attempts.extend(chain.attempts);

        let response = match chain.result {
            Ok(response) => response,
            Err(e) => return outcome.fail(e),
        };
        outcome.usage.input_tokens += response.input_tokens;
        outcome.usage.output_tokens += response.output_tokens;
        outcome.usage.pages_processed += sent.len();

        // ── Normalise ────────────────────────────────────────────────────
        outcome.enter(PipelineStage::Normalizing);
        match normalize(&response.text, &schema) {
            Ok(forms) => results.push(PageResult { pages: sent, forms }),
            Err(error) => {
                warn!("{range}: unparseable output for pages {sent:?}: {}", error.reason);
                last_error = Some(RangeError::Parse {
                    page: sent[0],
                    error: error.clone(),
                });
                outcome.diagnostics.push(Diagnostic::ParseError { pages: sent, error });
            }
        }
    }

    if results.is_empty() {
        return outcome.fail(last_error.unwrap_or(RangeError::RenderFailure {
            page: range.start_page,
            detail: "no page of the range could be read".to_string(),
        }));
    }

    // ── Consolidate ──────────────────────────────────────────────────────
    outcome.enter(PipelineStage::Consolidating);
    let records = consolidate(&range, schema.strategy, results);
    info!(
        "{range}: {} record(s) from {} call(s) in {}ms",
        records.len(),
        outcome.usage.api_calls,
        start.elapsed().as_millis()
    );
    outcome.result = Ok(records);
    outcome.enter(PipelineStage::Done);
    outcome
}

impl RangeOutcome {
    fn enter(&mut self, stage: PipelineStage) {
        if self.stage != stage {
            debug!("{}: {} → {}", self.range, self.stage, stage);
            self.stage = stage;
        }
    }

    fn fail(mut self, error: RangeError) -> Self {
        warn!("{}: {} failed: {error}", self.range, self.stage);
        self.stage = PipelineStage::Failed(self.range);
        self.result = Err(error);
        self
    }
}

/// Render `pages` and encode the ones that succeeded. Per-page failures are
/// returned alongside; only a failure of the document itself is an error.
async fn render_and_encode(
    document: &dyn Document,
    pages: &[usize],
    scale: f32,
) -> Result<(Vec<PageImage>, Vec<(usize, String)>), RangeError> {
    let rendered = document
        .render_pages(pages, scale)
        .await
        .map_err(|e| RangeError::RenderFailure {
            page: pages.first().copied().unwrap_or_default(),
            detail: e.to_string(),
        })?;

    let mut images = Vec::with_capacity(rendered.len());
    let mut failures = Vec::new();
    for (page, result) in rendered {
        match result.map_err(|e| e.to_string()).and_then(|img| {
            encode_page(page, &img).map_err(|e| format!("Image encoding failed: {e}"))
        }) {
            Ok(image) => images.push(image),
            Err(detail) => failures.push((page, detail)),
        }
    }
    Ok((images, failures))
}

/// A diagnostic when the call was served by a backend other than the first
/// one tried.
fn fallback_diagnostic(
    pages: &[usize],
    requested_model: &str,
    attempts: &[ExtractionAttempt],
) -> Option<Diagnostic> {
    let first = attempts.first()?;
    let last = attempts.last()?;
    if last.backend_id == first.backend_id && last.model_id == first.model_id {
        return None;
    }
    if last.outcome != crate::backend::AttemptOutcome::Success {
        return None;
    }
    Some(Diagnostic::Fallback {
        pages: pages.to_vec(),
        requested_model: requested_model.to_string(),
        served_by: last.backend_id.clone(),
        model: last.model_id.clone(),
    })
}
