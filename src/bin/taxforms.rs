//! CLI binary for edgequake-taxforms.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_taxforms::{
    detect, extract, open_document, record_output, AmbiguityPolicy, Classification, Credentials,
    ExtractionConfig, ExtractionOutput, ExtractionProgressCallback, FormRange, FormType,
    HistoryStore, JsonFileHistory, ProgressCallback, RangeError, DEFAULT_HISTORY_LIMIT,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over form ranges plus a log line per
/// finished range. Ranges complete out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Classifying pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, range: &FormRange) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut t| t.remove(&range.start_page))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_detection_complete(&self, ranges: &[FormRange]) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} forms  \
                 ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(ranges.len() as u64);
        self.bar.set_prefix("Extracting");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Detected {} form range(s)", ranges.len()))
        ));
        for range in ranges {
            self.bar.println(format!("  {} {}", dim("·"), range));
        }
    }

    fn on_range_start(&self, range: &FormRange) {
        if let Ok(mut t) = self.start_times.lock() {
            t.insert(range.start_page, Instant::now());
        }
        self.bar.set_message(range.to_string());
    }

    fn on_range_complete(&self, range: &FormRange, records: usize) {
        let secs = self.elapsed_secs(range);
        self.bar.println(format!(
            "  {} {:<28}  {}  {}",
            green("✓"),
            range.to_string(),
            dim(&format!("{records} record(s)")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_range_error(&self, range: &FormRange, error: &RangeError) {
        let secs = self.elapsed_secs(range);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let error = error.to_string();
        let msg = match error.char_indices().nth(80) {
            Some((cut, _)) => format!("{}\u{2026}", &error[..cut]),
            None => error,
        };
        self.bar.println(format!(
            "  {} {:<28}  {}  {}",
            red("✗"),
            range.to_string(),
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_extraction_complete(&self, total_ranges: usize, success_count: usize) {
        let failed = total_ranges.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} form range(s) extracted",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} form ranges extracted  ({} failed)",
                if failed == total_ranges { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_ranges,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract every supported form, human-readable summary
  taxforms package.pdf

  # Full JSON result to a file
  taxforms package.pdf -o package.json

  # Only show which pages hold which forms (no API key needed)
  taxforms --detect-only package.pdf

  # Force the form type of a scanned W-2 photo
  taxforms --form W-2 photo.jpg --json

  # Keep a history of extractions
  taxforms package.pdf --history ~/.taxforms/history.json
  taxforms --list-history --history ~/.taxforms/history.json

SUPPORTED FORMS:
  K-1 (1065)  per page, grouped by partner
  K-3         every page merged into one record
  8804, 8805  first page of each range
  W-2, 1099-INT, 1099-NEC, 1099-MISC  batches of up to 10 pages

MODELS:
  gemini-2.5-flash (default)       GEMINI_API_KEY, GEMINI_API_KEY_2
  meta-llama/llama-4-scout-…       GROQ_API_KEY, GROQ_API_KEY_2
  gpt-4o                           OPENAI_API_KEY, OPENAI_API_KEY_2
  anything else                    EDGEQUAKE_LLM_PROVIDER + EDGEQUAKE_MODEL

  When the chosen family stays rate-limited, other configured families
  are tried, then local tesseract OCR.

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH   Path to an existing libpdfium
  RUST_LOG          Overrides --verbose / --quiet
"#;

/// Detect and extract U.S. tax forms from PDFs and images.
#[derive(Parser, Debug)]
#[command(
    name = "taxforms",
    version,
    about = "Detect and extract U.S. tax forms from PDFs and images using Vision LLMs",
    long_about = "Classify the pages of a tax document package (K-1, K-3, 8804, 8805, W-2, \
1099-INT/NEC/MISC), group them into form instances, and extract each instance into a \
schema-complete JSON record using Gemini, Groq, OpenAI or any edgequake-llm provider.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF, PNG or JPEG file.
    #[arg(required_unless_present = "list_history")]
    input: Option<PathBuf>,

    /// Write the JSON result to this file.
    #[arg(short, long, env = "TAXFORMS_OUTPUT")]
    output: Option<PathBuf>,

    /// Vision model ID (gemini-2.5-flash, gpt-4o, meta-llama/…).
    #[arg(long, env = "TAXFORMS_MODEL", default_value = "gemini-2.5-flash")]
    model: String,

    /// Treat every page as this form type (K-1, K-3, 8804, 8805, W-2, 1099-INT, …).
    #[arg(long, env = "TAXFORMS_FORM")]
    form: Option<FormType>,

    /// Form ranges processed at once.
    #[arg(short, long, env = "TAXFORMS_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Images per call for batch forms (1–10).
    #[arg(long, env = "TAXFORMS_BATCH_SIZE", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(1..=10))]
    batch_size: u64,

    /// What to do with pages matching several form signatures.
    #[arg(long, env = "TAXFORMS_AMBIGUITY", value_enum, default_value = "precedence")]
    ambiguity: AmbiguityArg,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "TAXFORMS_PASSWORD")]
    password: Option<String>,

    /// Directory with registry.json and schema files, replacing the built-in set.
    #[arg(long, env = "TAXFORMS_SCHEMA_DIR")]
    schema_dir: Option<PathBuf>,

    /// Attempts per backend before falling back.
    #[arg(long, env = "TAXFORMS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "TAXFORMS_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Max LLM output tokens per call.
    #[arg(long, env = "TAXFORMS_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Rasterisation scale relative to the page size.
    #[arg(long, env = "TAXFORMS_RENDER_SCALE", default_value_t = 2.0)]
    render_scale: f32,

    /// Per-call HTTP timeout in seconds.
    #[arg(long, env = "TAXFORMS_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Never hand a call to a different model family.
    #[arg(long, env = "TAXFORMS_NO_FALLBACK")]
    no_fallback: bool,

    /// Do not fall back to local tesseract OCR.
    #[arg(long, env = "TAXFORMS_NO_OCR")]
    no_ocr: bool,

    /// Print the full result as JSON on stdout.
    #[arg(long, env = "TAXFORMS_JSON")]
    json: bool,

    /// Classify pages and print the detected form ranges only.
    #[arg(long)]
    detect_only: bool,

    /// JSON file that keeps a history of extractions.
    #[arg(long, env = "TAXFORMS_HISTORY")]
    history: Option<PathBuf>,

    /// List the entries of --history, newest first.
    #[arg(long, requires = "history")]
    list_history: bool,

    /// Disable progress bar.
    #[arg(long, env = "TAXFORMS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "TAXFORMS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "TAXFORMS_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum AmbiguityArg {
    Precedence,
    Reject,
}

impl From<AmbiguityArg> for AmbiguityPolicy {
    fn from(v: AmbiguityArg) -> Self {
        match v {
            AmbiguityArg::Precedence => AmbiguityPolicy::Precedence,
            AmbiguityArg::Reject => AmbiguityPolicy::Reject,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose asks for them.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.detect_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── History listing ──────────────────────────────────────────────────
    if cli.list_history {
        let path = cli.history.as_ref().context("--list-history needs --history")?;
        return list_history(path, cli.json).await;
    }

    let input = cli.input.clone().context("No input file given")?;

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Detect-only mode ─────────────────────────────────────────────────
    if cli.detect_only {
        let document = open_document(&input, config.password.as_deref())
            .await
            .context("Failed to open document")?;
        let detection = detect(document.as_ref(), &config).context("Classification failed")?;

        if cli.json {
            let json = serde_json::json!({
                "file": document.name(),
                "pages": detection.pages,
                "ranges": detection.ranges,
                "diagnostics": detection.diagnostics,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&json).context("Failed to serialise detection")?
            );
        } else {
            println!("File:    {}", document.name());
            println!("Pages:   {}", document.page_count());
            println!("Digital: {}", document.is_digital());
            for page in &detection.pages {
                let label = match &page.classification {
                    Classification::Form { form_type } => form_type.to_string(),
                    Classification::Continuation { form_type } => format!("{form_type} (continued)"),
                    Classification::Ambiguous { chosen, candidates } => {
                        format!("{chosen} (ambiguous: {candidates:?})")
                    }
                    Classification::Unknown => dim("-"),
                };
                println!("  page {:>3}  {}", page.page, label);
            }
            if detection.ranges.is_empty() {
                println!("{}", red("No supported tax forms detected"));
            }
            for range in &detection.ranges {
                println!("{} {}", cyan("◆"), range);
            }
        }
        return Ok(());
    }

    // ── Run extraction ───────────────────────────────────────────────────
    let output = extract(&input, &config)
        .await
        .context("Extraction failed")?;

    if let Some(ref path) = cli.output {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&output);
    }

    if let Some(ref path) = cli.history {
        let store = JsonFileHistory::new(path);
        let entry = record_output(&store, &output)
            .await
            .context("Failed to save history entry")?;
        if !cli.quiet && !cli.json {
            eprintln!("   {} {}", dim("history entry"), dim(&entry.id));
        }
    }

    if !cli.quiet && !cli.json {
        if let Some(ref path) = cli.output {
            eprintln!("   {} {}", dim("→"), bold(&path.display().to_string()));
        }
        eprintln!(
            "   {} tokens in  /  {} tokens out  —  {} API call(s), {:.1}s",
            dim(&output.usage.input_tokens.to_string()),
            dim(&output.usage.output_tokens.to_string()),
            output.usage.api_calls_made,
            output.usage.processing_time_seconds,
        );
    }

    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .model(cli.model.clone())
        .concurrency(cli.concurrency)
        .batch_size(cli.batch_size as usize)
        .ambiguity_policy(cli.ambiguity.clone().into())
        .max_retries(cli.max_retries)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .render_scale(cli.render_scale)
        .api_timeout_secs(cli.api_timeout)
        .cross_family_fallback(!cli.no_fallback)
        .ocr_fallback(!cli.no_ocr)
        .credentials(Credentials::from_env());

    if let Some(form) = cli.form {
        builder = builder.form_override(form);
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(ref dir) = cli.schema_dir {
        builder = builder.schema_dir(dir.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Human-readable listing of records and failures.
fn print_summary(output: &ExtractionOutput) {
    println!("{}", bold(&output.filename));
    for (key, value) in &output.document_metadata {
        if !value.is_null() {
            println!("  {:<24} {}", dim(key), value);
        }
    }
    for record in &output.records {
        let filled = record
            .planes
            .iter()
            .flat_map(|p| &p.fields)
            .filter(|f| !edgequake_taxforms::is_empty_value(&f.value))
            .count();
        let total: usize = record.planes.iter().map(|p| p.fields.len()).sum();
        println!(
            "  {} {:<10} pages {:<10} {:<32} {}",
            green("✓"),
            record.form_type.to_string(),
            record.page_reference,
            record.identity.as_deref().unwrap_or(""),
            dim(&format!("{filled}/{total} boxes")),
        );
    }
    for failure in &output.failures {
        println!("  {} {}  {}", red("✗"), failure.range, red(&failure.error.to_string()));
    }
    for diagnostic in &output.diagnostics {
        if let Ok(line) = serde_json::to_string(diagnostic) {
            println!("  {} {}", cyan("⚠"), dim(&line));
        }
    }
}

async fn list_history(path: &Path, json: bool) -> Result<()> {
    let store = JsonFileHistory::new(path);
    let entries = store
        .list_entries(DEFAULT_HISTORY_LIMIT)
        .await
        .context("Failed to read history")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("Failed to serialise history")?
        );
        return Ok(());
    }
    if entries.is_empty() {
        println!("{}", dim("No history entries"));
    }
    for entry in entries {
        println!(
            "{}  {:<32} {:>3} form(s)  {}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.filename,
            entry.total_forms_extracted,
            entry.form_types.join(", "),
            dim(&entry.id),
        );
    }
    Ok(())
}
