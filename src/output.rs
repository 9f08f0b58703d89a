//! Result types returned by the extraction pipeline.
//!
//! An [`ExtractionOutput`] is always returned for a document in which at
//! least one form was detected, even when some ranges failed: the records
//! that could be read sit next to an explicit [`RangeFailure`] for each
//! range that could not.

use crate::backend::ExtractionAttempt;
use crate::error::{ParseError, RangeError};
use crate::forms::{FormSchema, FormType};
use crate::pipeline::normalize::{canonical_json, NormalizedForm, Plane};
use crate::ranges::FormRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Everything one extraction run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// Display name of the input document.
    pub filename: String,
    /// Ranges found by page classification, in page order.
    pub ranges: Vec<FormRange>,
    /// Consolidated records, ordered by range start page.
    pub records: Vec<FormRecord>,
    /// Ranges that yielded no records, with the reason.
    pub failures: Vec<RangeFailure>,
    /// Header fields hoisted once per document: the first non-empty value
    /// of each metadata key across all records.
    pub document_metadata: BTreeMap<String, Value>,
    pub usage: UsageMetadata,
    /// Every backend call made, in completion order.
    pub attempts: Vec<ExtractionAttempt>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ExtractionOutput {
    /// Distinct form types with at least one record, in first-seen order.
    pub fn form_types(&self) -> Vec<FormType> {
        let mut out: Vec<FormType> = Vec::new();
        for record in &self.records {
            if !out.contains(&record.form_type) {
                out.push(record.form_type);
            }
        }
        out
    }

    pub fn records_of(&self, form_type: FormType) -> impl Iterator<Item = &FormRecord> {
        self.records.iter().filter(move |r| r.form_type == form_type)
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One consolidated form instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormRecord {
    pub form_type: FormType,
    pub schema_version: String,
    /// `"7"`, `"2-11"`, or `"3-4, 7"`.
    pub page_reference: String,
    /// Partner name for multi-entity forms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Header fields of this record.
    pub document_metadata: BTreeMap<String, Value>,
    pub planes: Vec<Plane>,
}

impl FormRecord {
    pub fn from_normalized(form: NormalizedForm, page_reference: String) -> Self {
        Self {
            form_type: form.form_type,
            schema_version: form.schema_version,
            page_reference,
            identity: form.identity,
            document_metadata: form.metadata,
            planes: form.planes,
        }
    }

    pub fn value(&self, plane: &str, code: &str) -> Option<&Value> {
        self.planes
            .iter()
            .find(|p| p.name == plane)
            .and_then(|p| p.fields.iter().find(|f| f.code == code))
            .map(|f| &f.value)
    }

    /// Every box as `"<plane>.<code>" -> value`. Codes alone are not unique:
    /// each K-3 part numbers its lines from 1.
    pub fn flat_fields(&self) -> BTreeMap<String, &Value> {
        self.planes
            .iter()
            .flat_map(|p| {
                p.fields
                    .iter()
                    .map(move |f| (format!("{}.{}", p.name, f.code), &f.value))
            })
            .collect()
    }

    /// The record in its schema's canonical JSON shape.
    pub fn to_canonical(&self, schema: &FormSchema) -> Value {
        let form = NormalizedForm {
            form_type: self.form_type,
            schema_version: self.schema_version.clone(),
            identity: self.identity.clone(),
            source_page: None,
            metadata: self.document_metadata.clone(),
            planes: self.planes.clone(),
        };
        canonical_json(schema, std::slice::from_ref(&form))
    }
}

/// A range that produced no records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeFailure {
    pub range: FormRange,
    pub error: RangeError,
}

/// Token, call and timing totals for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    /// Model requested by the caller. Fallback models appear in `attempts`.
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
    pub processing_time_seconds: f64,
    pub api_calls_made: usize,
    pub pages_processed: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl UsageMetadata {
    pub fn started(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            processing_time_seconds: 0.0,
            api_calls_made: 0,
            pages_processed: 0,
            start_time: now,
            end_time: now,
        }
    }

    pub fn add_tokens(&mut self, input: usize, output: usize) {
        self.input_tokens += input;
        self.output_tokens += output;
        self.total_tokens = self.input_tokens + self.output_tokens;
    }

    /// Stamp the end time and derive the elapsed seconds.
    pub fn finish(&mut self) {
        self.end_time = Utc::now();
        self.processing_time_seconds =
            (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0;
    }
}

/// Something worth telling the operator that did not stop the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A page matched several form signatures.
    AmbiguousClassification {
        page: usize,
        candidates: Vec<FormType>,
        /// `None` when the page was rejected.
        chosen: Option<FormType>,
    },
    /// A backend other than the first choice served a call.
    Fallback {
        pages: Vec<usize>,
        requested_model: String,
        served_by: String,
        model: String,
    },
    /// One call's output could not be parsed; the range continued without it.
    ParseError { pages: Vec<usize>, error: ParseError },
    /// A page failed to render; the range continued without it.
    RenderFailure { page: usize, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::SchemaRegistry;

    fn record(form_type: FormType) -> FormRecord {
        let schema = SchemaRegistry::embedded().unwrap().get(form_type).unwrap();
        FormRecord::from_normalized(NormalizedForm::empty(&schema), "1".into())
    }

    #[test]
    fn flat_fields_keep_repeated_codes_apart() {
        let schema = SchemaRegistry::embedded().unwrap().get(FormType::ScheduleK3).unwrap();
        let rec = record(FormType::ScheduleK3);
        let flat = rec.flat_fields();
        assert_eq!(flat.len(), schema.field_count());
        let ones = flat.keys().filter(|k| k.ends_with(".1")).count();
        assert!(ones > 1);
    }

    fn output(records: Vec<FormRecord>) -> ExtractionOutput {
        ExtractionOutput {
            filename: "doc.pdf".into(),
            ranges: vec![],
            records,
            failures: vec![],
            document_metadata: BTreeMap::new(),
            usage: UsageMetadata::started("gemini-2.5-flash"),
            attempts: vec![],
            diagnostics: vec![],
        }
    }

    #[test]
    fn form_types_in_first_seen_order() {
        let out = output(vec![
            record(FormType::ScheduleK3),
            record(FormType::ScheduleK1),
            record(FormType::ScheduleK3),
        ]);
        assert_eq!(out.form_types(), vec![FormType::ScheduleK3, FormType::ScheduleK1]);
        assert_eq!(out.records_of(FormType::ScheduleK3).count(), 2);
        assert!(out.is_complete());
    }

    #[test]
    fn usage_totals() {
        let mut usage = UsageMetadata::started("gpt-4o");
        usage.add_tokens(100, 20);
        usage.add_tokens(50, 5);
        usage.finish();
        assert_eq!(usage.total_tokens, 175);
        assert!(usage.end_time >= usage.start_time);
        assert!(usage.processing_time_seconds >= 0.0);
    }

    #[test]
    fn canonical_shape_round_trips_through_record() {
        let registry = SchemaRegistry::embedded().unwrap();
        let schema = registry.get(FormType::Form8805).unwrap();
        let rec = record(FormType::Form8805);
        assert_eq!(rec.to_canonical(&schema), canonical_json(&schema, &[]));
    }

    #[test]
    fn diagnostics_serialise_with_kind_tag() {
        let d = Diagnostic::AmbiguousClassification {
            page: 3,
            candidates: vec![FormType::ScheduleK1, FormType::ScheduleK3],
            chosen: Some(FormType::ScheduleK1),
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["kind"], "ambiguous_classification");
        assert_eq!(v["page"], 3);
    }
}
