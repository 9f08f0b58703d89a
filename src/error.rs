//! Error types for the edgequake-taxforms library.
//!
//! Four error types reflect four distinct failure scopes:
//!
//! * [`TaxFormError`] (Fatal): the document cannot be processed at all
//!   (bad input file, wrong password, broken schema registry, nothing that
//!   looks like a tax form). Returned as `Err(TaxFormError)` from the
//!   top-level `extract*` functions.
//!
//! * [`BackendError`] (Per call): one request to a vision backend failed.
//!   Its [`BackendErrorKind`] drives the retry and fallback machinery in
//!   [`crate::backend`]; it never escapes the range that issued the call.
//!
//! * [`RangeError`] (Non-fatal): one form range failed (render glitch,
//!   exhausted retries, unparseable model output) while sibling ranges are
//!   fine. Stored in [`crate::output::RangeFailure`] so callers can inspect
//!   partial success.
//!
//! * [`ParseError`]: the model answered, but not with JSON. The raw text is
//!   kept so an operator can see what the model actually said.

use crate::forms::FormType;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-taxforms library.
#[derive(Debug, Error)]
pub enum TaxFormError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file is neither a PDF nor a PNG/JPEG image.
    #[error("Unsupported input '{path}': expected a PDF, PNG or JPEG file\nFirst bytes: {magic:?}")]
    UnsupportedInput { path: PathBuf, magic: [u8; 4] },

    /// The image file could not be decoded.
    #[error("Failed to decode image '{path}': {detail}")]
    ImageDecodeFailed { path: PathBuf, detail: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// A page index outside the document was requested.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── Detection errors ──────────────────────────────────────────────────
    /// Classification found no page belonging to a supported form.
    #[error("No supported tax forms detected in '{source_name}' ({pages} pages scanned)")]
    NoFormsDetected { source_name: String, pages: usize },

    // ── Schema errors ─────────────────────────────────────────────────────
    /// The registry has no schema for a detected form type.
    #[error("No extraction schema registered for {form_type}")]
    SchemaNotFound { form_type: FormType },

    /// A schema or registry file is malformed.
    #[error("Invalid schema '{name}': {detail}")]
    InvalidSchema { name: String, detail: String },

    /// A schema file could not be read from disk.
    #[error("Failed to read schema file '{path}': {source}")]
    SchemaIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Backend errors ────────────────────────────────────────────────────
    /// No vision backend or OCR fallback is available for the requested model.
    #[error("No extraction backend available for model '{model}'.\n{hint}")]
    NoBackendAvailable { model: String, hint: String },

    // ── History errors ────────────────────────────────────────────────────
    /// Reading or writing the history file failed.
    #[error("History store error at '{path}': {detail}")]
    History { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium system-wide, or set PDFIUM_LIB_PATH=/path/to/libpdfium\n\
to point at an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Whether a failed backend call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Rate-limited or overloaded; retry after a delay.
    Transient,
    /// Auth failure, malformed request, unusable response; never retried.
    Fatal,
}

/// A failed call to one vision backend.
#[derive(Debug, Clone, Error)]
#[error("{backend}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    /// Identifier of the backend that failed, e.g. `groq#2`.
    pub backend: String,
    /// HTTP status when the failure came from an HTTP response.
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn transient(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Transient,
            backend: backend.into(),
            status: None,
            message: message.into(),
        }
    }

    pub fn fatal(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Fatal,
            backend: backend.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Classify an HTTP failure.
    ///
    /// 429 and 503 are transient, as is any body reporting the model as
    /// overloaded or rate limited. Everything else (401, 403, 400, 404, …)
    /// is fatal.
    pub fn from_status(backend: impl Into<String>, status: u16, body: &str) -> Self {
        let lower = body.to_ascii_lowercase();
        let transient = matches!(status, 429 | 503)
            || lower.contains("overloaded")
            || lower.contains("rate_limit")
            || lower.contains("resource_exhausted");
        Self {
            kind: if transient {
                BackendErrorKind::Transient
            } else {
                BackendErrorKind::Fatal
            },
            backend: backend.into(),
            status: Some(status),
            message: format!("HTTP {status}: {}", truncate(body, 300)),
        }
    }

    /// Classify a failure that only comes with a message string.
    pub fn from_message(backend: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let transient = lower.contains("429")
            || lower.contains("503")
            || lower.contains("overloaded")
            || lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("timed out")
            || lower.contains("timeout");
        Self {
            kind: if transient {
                BackendErrorKind::Transient
            } else {
                BackendErrorKind::Fatal
            },
            backend: backend.into(),
            status: None,
            message,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }
}

/// Model output that could not be parsed as JSON after fence stripping.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("Failed to parse model output as JSON: {reason}")]
pub struct ParseError {
    pub reason: String,
    /// Exactly what the model returned, for operator diagnosis.
    pub raw: String,
}

/// A non-fatal error scoped to one form range.
///
/// The extraction continues for every other range in the document.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeError {
    /// Rasterising a page of the range failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailure { page: usize, detail: String },

    /// Every backend in the fallback chain stayed rate-limited or overloaded.
    #[error("Backend still unavailable after {attempts} attempts: {detail}")]
    BackendTransient { attempts: u32, detail: String },

    /// A backend rejected the request outright.
    #[error("Backend rejected the request: {detail}")]
    BackendFatal { detail: String },

    /// The model output was not JSON; the raw text is attached.
    #[error("Page {page}: {error}")]
    Parse { page: usize, error: ParseError },

    /// No schema is registered for the range's form type.
    #[error("No extraction schema registered for {form_type}")]
    SchemaMissing { form_type: String },

    /// No backend could serve the request.
    #[error("No backend available: {detail}")]
    NoBackend { detail: String },
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_and_503_are_transient() {
        assert!(BackendError::from_status("gemini", 429, "").is_transient());
        assert!(BackendError::from_status("gemini", 503, "").is_transient());
    }

    #[test]
    fn overloaded_body_is_transient_regardless_of_status() {
        let e = BackendError::from_status("gemini", 500, r#"{"error":"The model is overloaded"}"#);
        assert!(e.is_transient());
    }

    #[test]
    fn auth_and_bad_request_are_fatal() {
        assert!(!BackendError::from_status("openai", 401, "invalid api key").is_transient());
        assert!(!BackendError::from_status("openai", 403, "forbidden").is_transient());
        assert!(!BackendError::from_status("openai", 400, "bad image").is_transient());
    }

    #[test]
    fn message_classification() {
        assert!(BackendError::from_message("p", "HTTP 503 Service Unavailable").is_transient());
        assert!(!BackendError::from_message("p", "invalid_api_key").is_transient());
    }

    #[test]
    fn parse_error_range_display_keeps_page() {
        let e = RangeError::Parse {
            page: 4,
            error: ParseError {
                reason: "expected value".into(),
                raw: "Sorry, I cannot read this".into(),
            },
        };
        assert!(e.to_string().contains("Page 4"));
    }

    #[test]
    fn no_forms_display() {
        let e = TaxFormError::NoFormsDetected {
            source_name: "scan.pdf".into(),
            pages: 12,
        };
        let msg = e.to_string();
        assert!(msg.contains("scan.pdf"), "got: {msg}");
        assert!(msg.contains("12 pages"), "got: {msg}");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ééééé";
        let t = truncate(s, 3);
        assert!(t.starts_with('é'));
        assert!(t.ends_with('…'));
    }
}
