//! Last-resort local OCR: `tesseract` text plus regex field capture.
//!
//! When every vision model is rate limited or unconfigured, a page can still
//! yield its identifying fields (tax year, names, EIN/TIN, copy letter)
//! from plain OCR text. The result is emitted as a flat JSON object so it
//! goes through the same alias normalization as model output; every box
//! the regexes cannot see falls back to its schema default.

use super::{BackendFamily, BackendResponse, ExtractionBackend, ExtractionRequest};
use crate::error::BackendError;
use crate::pipeline::encode::PageImage;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

static RE_TAX_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b20[12][0-9]\b").unwrap());
static RE_EIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{2}[-\s]?\d{7}\b").unwrap());
static RE_TIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}[-\s]?\d{2}[-\s]?\d{4}\b").unwrap());
static RE_PARTNER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)partner['"]?s?\s*name[:\s]+([^\n]+)"#).unwrap());
static RE_PARTNERSHIP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)partnership['"]?s?\s*name[:\s]+([^\n]+)"#).unwrap());

const PARTNER_TYPES: [&str; 5] = ["INDIVIDUAL", "CORPORATION", "PARTNERSHIP", "TRUST", "ESTATE"];

pub struct OcrBackend {
    id: String,
    binary: String,
}

impl Default for OcrBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrBackend {
    pub fn new() -> Self {
        Self {
            id: BackendFamily::LocalOcr.to_string(),
            binary: "tesseract".to_string(),
        }
    }

    /// Use a tesseract binary outside `PATH`.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn recognize(&self, image: &PageImage) -> Result<String, BackendError> {
        let fatal = |msg: String| BackendError::fatal(&self.id, msg);

        let bytes = image
            .decode()
            .map_err(|e| fatal(format!("page {}: bad image data: {e}", image.page)))?;
        let file = tempfile::Builder::new()
            .prefix("taxforms-ocr-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| fatal(format!("scratch file: {e}")))?;
        tokio::fs::write(file.path(), &bytes)
            .await
            .map_err(|e| fatal(format!("scratch file: {e}")))?;

        let output = tokio::process::Command::new(&self.binary)
            .arg(file.path())
            .arg("stdout")
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    fatal(format!("'{}' not found; install tesseract-ocr", self.binary))
                } else {
                    fatal(format!("failed to run {}: {e}", self.binary))
                }
            })?;

        if !output.status.success() {
            return Err(fatal(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("{}: page {} → {} chars", self.id, image.page, text.len());
        Ok(text)
    }
}

#[async_trait]
impl ExtractionBackend for OcrBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::LocalOcr
    }

    async fn generate(&self, request: &ExtractionRequest) -> Result<BackendResponse, BackendError> {
        let mut records = Vec::with_capacity(request.images.len());
        for image in &request.images {
            let text = self.recognize(image).await?;
            let mut fields = fields_from_text(&text);
            fields.insert("page_number".into(), Value::from(image.page));
            records.push(Value::Object(fields));
        }

        let payload = match (&request.schema.records_key, records.len()) {
            (_, 1) => records.swap_remove(0),
            (Some(key), _) => {
                let mut root = Map::new();
                root.insert(key.clone(), Value::Array(records));
                Value::Object(root)
            }
            (None, _) => records.into_iter().next().unwrap_or(Value::Object(Map::new())),
        };

        Ok(BackendResponse {
            text: payload.to_string(),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

/// Capture identifying fields from OCR text. Absent fields are omitted.
pub fn fields_from_text(text: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            fields.insert(key.to_string(), Value::String(v));
        }
    };

    let capture = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    };
    let first = |re: &Regex| re.find(text).map(|m| m.as_str().to_string());

    let ein = first(&RE_EIN);
    put("tax_year", first(&RE_TAX_YEAR));
    put("partner_name", capture(&RE_PARTNER_NAME));
    put("partnership_name", capture(&RE_PARTNERSHIP_NAME));
    put("partnership_ein", ein.clone());
    put("ein", ein);
    let tin = first(&RE_TIN);
    put("ssn", tin.clone());
    put("tin", tin);

    let upper = text.to_ascii_uppercase();
    put(
        "partner_type",
        PARTNER_TYPES
            .iter()
            .find(|t| upper.contains(*t))
            .map(|t| t.to_string()),
    );
    put("copy_type", Some(copy_type(&upper).to_string()));
    fields
}

/// Printed copy designation; Copy B when none is legible.
fn copy_type(upper: &str) -> &'static str {
    if upper.contains("COPY A") {
        "Copy A - For IRS"
    } else if upper.contains("COPY B") {
        "Copy B - For Partner"
    } else if upper.contains("COPY C") {
        "Copy C - For Partner"
    } else if upper.contains("COPY D") {
        "Copy D - For Withholding Agent"
    } else {
        "Copy B - For Partner"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Form 8805 (2024) Copy C\n\
        Foreign partner's name: Jane Q Example\n\
        U.S. identifying number 123-45-6789\n\
        Partnership's name: Example Fund LP\n\
        EIN 12-3456789\n\
        Type of partner INDIVIDUAL\n";

    #[test]
    fn captures_identifying_fields() {
        let f = fields_from_text(SAMPLE);
        assert_eq!(f["tax_year"], "2024");
        assert_eq!(f["partner_name"], "Jane Q Example");
        assert_eq!(f["partnership_name"], "Example Fund LP");
        assert_eq!(f["partnership_ein"], "12-3456789");
        assert_eq!(f["tin"], "123-45-6789");
        assert_eq!(f["partner_type"], "INDIVIDUAL");
        assert_eq!(f["copy_type"], "Copy C - For Partner");
    }

    #[test]
    fn missing_fields_are_omitted_and_copy_defaults_to_b() {
        let f = fields_from_text("nothing legible here");
        assert!(!f.contains_key("partner_name"));
        assert!(!f.contains_key("tin"));
        assert_eq!(f["copy_type"], "Copy B - For Partner");
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let backend = OcrBackend::new().with_binary("definitely-not-a-tesseract-binary");
        let image = PageImage {
            page: 1,
            data_b64: "iVBORw0KGgo=".into(),
            mime_type: "image/png",
        };
        let err = backend.recognize(&image).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message.contains("not found"), "{}", err.message);
    }
}
