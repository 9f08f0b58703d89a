//! Reconcile raw model output with a form's canonical schema.
//!
//! Models are asked for the canonical shape but drift: they rename keys,
//! nest sections differently, wrap the JSON in Markdown fences, or return a
//! flat bag of `box_1`-style keys. Normalisation turns all of that into a
//! [`NormalizedForm`] in which every box of the schema is present.
//!
//! ## Two passes per plane
//!
//! 1. **Canonical pass**: when the record carries the plane's container
//!    (`"financial_plane": [{ "data": [...] }]`, or `parts[]` with a
//!    matching `part_number`), each `{code, value}` entry is taken as-is
//!    and only cleaned.
//! 2. **Alias pass**: otherwise the record is flattened to
//!    underscore-joined keys and each box's ordered alias list is tried:
//!    exact or suffix match first, then a match on token boundaries.
//!    `null`, `""` and `"N/A"` never count as a hit.
//!
//! A box found by neither pass takes its schema default.

use crate::error::ParseError;
use crate::forms::{FieldKind, FieldSpec, FormSchema, FormType, PlaneLayout, PlaneSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Keys that hold several records even when the schema names none.
const GENERIC_RECORD_KEYS: [&str; 2] = ["forms", "partner_records"];

/// Keys a record may use to say which page it came from.
const PAGE_KEYS: [&str; 3] = ["page_number", "source_page", "page"];

// ── Output types ─────────────────────────────────────────────────────────

/// One box with its resolved value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxValue {
    pub code: String,
    pub label: String,
    pub value: Value,
}

/// A named group of boxes, in schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub fields: Vec<BoxValue>,
}

/// One schema-complete form instance as read from one model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedForm {
    pub form_type: FormType,
    pub schema_version: String,
    /// Partner name for multi-entity forms, as the model wrote it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Page the model attributed this record to, when it said so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_page: Option<usize>,
    pub metadata: BTreeMap<String, Value>,
    pub planes: Vec<Plane>,
}

impl NormalizedForm {
    /// A record holding only schema defaults.
    pub fn empty(schema: &FormSchema) -> Self {
        Self {
            form_type: schema.form_type,
            schema_version: schema.version.clone(),
            identity: None,
            source_page: None,
            metadata: schema
                .metadata
                .iter()
                .map(|f| (f.code.clone(), f.default_value()))
                .collect(),
            planes: schema
                .planes
                .iter()
                .map(|plane| Plane {
                    name: plane.name.clone(),
                    part_number: plane.part_number.clone(),
                    label: plane.label.clone(),
                    fields: plane
                        .fields
                        .iter()
                        .map(|f| BoxValue {
                            code: f.code.clone(),
                            label: f.label.clone(),
                            value: f.default_value(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn value(&self, plane: &str, code: &str) -> Option<&Value> {
        self.planes
            .iter()
            .find(|p| p.name == plane)
            .and_then(|p| p.fields.iter().find(|f| f.code == code))
            .map(|f| &f.value)
    }

    /// Number of boxes over all planes.
    pub fn field_count(&self) -> usize {
        self.planes.iter().map(|p| p.fields.len()).sum()
    }
}

// ── Entry point ──────────────────────────────────────────────────────────

/// Parse `raw` model text and reconcile it with `schema`.
///
/// Always yields at least one record; a payload with no recognisable
/// content yields one record of defaults.
pub fn normalize(raw: &str, schema: &FormSchema) -> Result<Vec<NormalizedForm>, ParseError> {
    let root = unwrap_record_wrappers(parse_json(raw)?, schema);

    let root_obj = match &root {
        Value::Object(map) => Some(map),
        Value::Array(_) | Value::Null => None,
        other => {
            return Err(ParseError {
                reason: format!("expected a JSON object, got {}", json_kind(other)),
                raw: raw.to_string(),
            })
        }
    };

    let (records_key, records) = split_records(&root, schema);
    let root_flat = root_obj
        .map(|m| flatten_object(m, records_key))
        .unwrap_or_default();

    let empty = Map::new();
    let forms: Vec<NormalizedForm> = if records.is_empty() {
        vec![normalize_record(root_obj.unwrap_or(&empty), &root_flat, schema)]
    } else {
        records
            .into_iter()
            .map(|record| {
                let flat = flatten_object(record, None);
                let lookup = Lookup {
                    scopes: [flat, root_flat.clone()],
                };
                build_form(record, &lookup, schema)
            })
            .collect()
    };

    debug!(
        "Normalised {} record(s) of {} v{}",
        forms.len(),
        schema.form_type,
        schema.version
    );
    Ok(forms)
}

fn normalize_record(
    record: &Map<String, Value>,
    flat: &[(String, &Value)],
    schema: &FormSchema,
) -> NormalizedForm {
    let lookup = Lookup {
        scopes: [flat.to_vec(), Vec::new()],
    };
    build_form(record, &lookup, schema)
}

// ── Fence stripping & parsing ────────────────────────────────────────────

/// Remove a leading ```` ```json ```` / ```` ``` ```` fence line and a
/// trailing ```` ``` ````.
pub fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.find('\n') {
            Some(nl) => &rest[nl + 1..],
            None => rest.trim_start_matches("json"),
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

fn parse_json(raw: &str) -> Result<Value, ParseError> {
    let text = strip_fences(raw);
    match serde_json::from_str::<Value>(text) {
        Ok(v) => Ok(v),
        Err(first) => {
            // Prose around the object ("Here is the data: {...}").
            let embedded = match (text.find('{'), text.rfind('}')) {
                (Some(start), Some(end)) if end > start => {
                    serde_json::from_str::<Value>(&text[start..=end]).ok()
                }
                _ => None,
            };
            embedded.ok_or_else(|| {
                warn!("Model output is not JSON: {first}");
                ParseError {
                    reason: first.to_string(),
                    raw: raw.to_string(),
                }
            })
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Record splitting ─────────────────────────────────────────────────────

/// Locate the record array. Returns the key it was found under (so the root
/// scope can skip it) and the record objects.
fn split_records<'a>(
    root: &'a Value,
    schema: &'a FormSchema,
) -> (Option<&'a str>, Vec<&'a Map<String, Value>>) {
    match root {
        Value::Array(items) => (None, items.iter().filter_map(Value::as_object).collect()),
        Value::Object(map) => {
            for key in record_keys(schema) {
                if let Some(Value::Array(items)) = map.get(key) {
                    let records: Vec<_> = items.iter().filter_map(Value::as_object).collect();
                    return (Some(key), records);
                }
            }
            (None, vec![map])
        }
        _ => (None, Vec::new()),
    }
}

fn record_keys(schema: &FormSchema) -> impl Iterator<Item = &str> {
    schema
        .records_key
        .as_deref()
        .into_iter()
        .chain(GENERIC_RECORD_KEYS)
}

/// `[{"forms": [a]}, {"forms": [b]}]` becomes `{"forms": [a, b]}`. Other
/// wrapper keys are kept, the first occurrence winning. Arrays of plain
/// records are returned unchanged.
fn unwrap_record_wrappers(root: Value, schema: &FormSchema) -> Value {
    let key = match &root {
        Value::Array(items) => items.iter().filter_map(Value::as_object).find_map(|m| {
            record_keys(schema).find(|k| matches!(m.get(*k), Some(Value::Array(_))))
        }),
        _ => None,
    };

    match (key, root) {
        (Some(key), Value::Array(items)) => {
            let mut merged = Map::new();
            let mut records = Vec::new();
            for item in items {
                let Value::Object(mut map) = item else {
                    continue;
                };
                if let Some(Value::Array(inner)) = map.remove(key) {
                    records.extend(inner);
                }
                for (k, v) in map {
                    merged.entry(k).or_insert(v);
                }
            }
            merged.insert(key.to_string(), Value::Array(records));
            Value::Object(merged)
        }
        (_, root) => root,
    }
}

// ── Flattening & alias lookup ────────────────────────────────────────────

/// Lowercase, collapse every non-alphanumeric run to `_`, trim `_`.
pub fn normalize_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Every node below `map` keyed by its underscore-joined path, in document
/// order. Objects and arrays are emitted as well as their children.
fn flatten_object<'a>(map: &'a Map<String, Value>, skip: Option<&str>) -> Vec<(String, &'a Value)> {
    let mut out = Vec::new();
    for (k, v) in map {
        if Some(k.as_str()) == skip {
            continue;
        }
        flatten_into(normalize_key(k), v, &mut out);
    }
    out
}

fn flatten_into<'a>(key: String, value: &'a Value, out: &mut Vec<(String, &'a Value)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(join_key(&key, &normalize_key(k)), v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(join_key(&key, &i.to_string()), v, out);
            }
        }
        _ => {}
    }
    out.push((key, value));
}

fn join_key(prefix: &str, key: &str) -> String {
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}_{key}"),
    }
}

/// `null`, blank strings and `"N/A"` are not values.
pub fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => {
            let t = s.trim();
            t.is_empty() || t.eq_ignore_ascii_case("n/a")
        }
        _ => false,
    }
}

/// Flattened record scope, then flattened document root.
struct Lookup<'a> {
    scopes: [Vec<(String, &'a Value)>; 2],
}

impl<'a> Lookup<'a> {
    fn find(&self, aliases: &[String], accept: impl Fn(&Value) -> bool) -> Option<&'a Value> {
        let aliases: Vec<String> = aliases
            .iter()
            .map(|a| normalize_key(a))
            .filter(|a| !a.is_empty())
            .collect();
        let usable = |v: &Value| !is_blank(v) && accept(v);

        for scope in &self.scopes {
            for alias in &aliases {
                let suffix = format!("_{alias}");
                let hit = scope.iter().find(|entry| {
                    let (key, value) = (&entry.0, entry.1);
                    (key == alias || key.ends_with(&suffix)) && usable(value)
                });
                if let Some(entry) = hit {
                    return Some(entry.1);
                }
            }
            for alias in &aliases {
                let token = format!("_{alias}_");
                let hit = scope.iter().find(|entry| {
                    format!("_{}_", entry.0).contains(&token) && usable(entry.1)
                });
                if let Some(entry) = hit {
                    return Some(entry.1);
                }
            }
        }
        None
    }
}

fn is_scalar(v: &Value) -> bool {
    !matches!(v, Value::Object(_) | Value::Array(_))
}

fn accepts(kind: FieldKind) -> fn(&Value) -> bool {
    match kind {
        FieldKind::LineItems => |v| matches!(v, Value::Array(_) | Value::Object(_)),
        _ => is_scalar,
    }
}

// ── Canonical containers ─────────────────────────────────────────────────

struct CanonicalEntry<'a> {
    value: &'a Value,
    label: Option<&'a str>,
}

/// Entries of `plane` in canonical shape, keyed by lowercased box code.
/// `None` when the record has no container for the plane.
fn canonical_plane<'a>(
    record: &'a Map<String, Value>,
    plane: &PlaneSpec,
) -> Option<HashMap<String, CanonicalEntry<'a>>> {
    let mut entries = HashMap::new();

    if plane.layout == PlaneLayout::Part {
        let wanted = plane.part_number.as_deref()?.trim();
        let part = find_container(record, "parts")?.as_array()?.iter().find(|p| {
            p.get("part_number")
                .and_then(Value::as_str)
                .is_some_and(|n| n.trim().eq_ignore_ascii_case(wanted))
        })?;
        collect_entries(part.get("fields")?, &mut entries);
        return Some(entries);
    }

    let container = find_container(record, &plane.name)?;
    match container {
        Value::Array(items) if items.iter().any(|i| i.get("data").is_some()) => {
            for data in items.iter().filter_map(|i| i.get("data")) {
                collect_entries(data, &mut entries);
            }
        }
        Value::Array(_) => collect_entries(container, &mut entries),
        Value::Object(map) => match map.get("data") {
            Some(data) => collect_entries(data, &mut entries),
            // `{ "box_1": 100 }`: keys may be codes or aliases.
            None => {
                for (key, v) in map {
                    let value = v.get("value").unwrap_or(v);
                    entries
                        .entry(key.trim().to_ascii_lowercase())
                        .or_insert(CanonicalEntry { value, label: None });
                    entries
                        .entry(normalize_key(key))
                        .or_insert(CanonicalEntry { value, label: None });
                }
            }
        },
        _ => return None,
    }
    Some(entries)
}

/// The value stored under `name` in `map`, or else the first one found at
/// any depth below it (`"boxes": [{"financial_plane": [..]}]`).
fn find_container<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    map.get(name)
        .or_else(|| map.values().find_map(|v| find_nested(v, name)))
}

fn find_nested<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => find_container(map, name),
        Value::Array(items) => items.iter().find_map(|i| find_nested(i, name)),
        _ => None,
    }
}

fn collect_entries<'a>(list: &'a Value, out: &mut HashMap<String, CanonicalEntry<'a>>) {
    let Some(items) = list.as_array() else {
        return;
    };
    for item in items {
        let code = match item.get("code") {
            Some(Value::String(s)) => s.trim().to_ascii_lowercase(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        out.entry(code).or_insert(CanonicalEntry {
            value: item.get("value").unwrap_or(&Value::Null),
            label: item.get("label").and_then(Value::as_str),
        });
    }
}

// ── Record assembly ──────────────────────────────────────────────────────

fn build_form(record: &Map<String, Value>, lookup: &Lookup<'_>, schema: &FormSchema) -> NormalizedForm {
    let mut form = NormalizedForm::empty(schema);

    form.source_page = PAGE_KEYS.iter().find_map(|k| match record.get(*k) {
        Some(Value::Number(n)) => n.as_u64().map(|p| p as usize),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    });

    if let Some(identity) = &schema.identity {
        form.identity = lookup
            .find(&with_code(identity), is_scalar)
            .map(|v| clean_value(FieldKind::String, v))
            .and_then(|v| v.as_str().map(str::to_string));
    }

    for field in &schema.metadata {
        if let Some(v) = lookup.find(&with_code(field), accepts(field.kind)) {
            let cleaned = clean_value(field.kind, v);
            if !cleaned.is_null() {
                form.metadata.insert(field.code.clone(), cleaned);
            }
        }
    }

    for (spec, plane) in schema.planes.iter().zip(form.planes.iter_mut()) {
        match canonical_plane(record, spec) {
            Some(entries) => {
                for (field, slot) in spec.fields.iter().zip(plane.fields.iter_mut()) {
                    let entry = entries.get(&field.code.to_ascii_lowercase()).or_else(|| {
                        field
                            .aliases
                            .iter()
                            .find_map(|a| entries.get(&normalize_key(a)))
                    });
                    if let Some(entry) = entry {
                        slot.value = clean_or_default(field, entry.value);
                        if !field.label_aliases.is_empty() {
                            if let Some(label) = entry.label.filter(|l| !l.trim().is_empty()) {
                                slot.label = label.trim().to_string();
                            }
                        }
                    }
                }
            }
            None => {
                for (field, slot) in spec.fields.iter().zip(plane.fields.iter_mut()) {
                    resolve_by_alias(field, slot, lookup);
                }
            }
        }
    }
    form
}

/// Metadata and identity also answer to their own code.
fn with_code(field: &FieldSpec) -> Vec<String> {
    std::iter::once(field.code.clone())
        .chain(field.aliases.iter().cloned())
        .collect()
}

fn resolve_by_alias(field: &FieldSpec, slot: &mut BoxValue, lookup: &Lookup<'_>) {
    let mut value = lookup
        .find(&field.aliases, accepts(field.kind))
        .map(|v| clean_value(field.kind, v))
        .unwrap_or(Value::Null);

    if !field.combine_with.is_empty() {
        let extra = lookup
            .find(&field.combine_with, is_scalar)
            .map(|v| clean_value(FieldKind::String, v));
        if let Some(Value::String(extra)) = extra {
            let sep = field.separator.as_deref().unwrap_or(", ");
            value = match value {
                Value::String(main) => Value::String(format!("{main}{sep}{extra}")),
                _ => Value::String(extra),
            };
        }
    }

    if !field.label_aliases.is_empty() {
        if let Some(Value::String(label)) = lookup
            .find(&field.label_aliases, is_scalar)
            .map(|v| clean_value(FieldKind::String, v))
        {
            slot.label = label;
        }
    }

    slot.value = if value.is_null() {
        field.default_value()
    } else {
        value
    };
}

fn clean_or_default(field: &FieldSpec, raw: &Value) -> Value {
    match clean_value(field.kind, raw) {
        Value::Null => field.default_value(),
        v => v,
    }
}

// ── Value cleaning ───────────────────────────────────────────────────────

/// Coerce a raw model value to `kind`. `Null` means "no value".
pub fn clean_value(kind: FieldKind, raw: &Value) -> Value {
    if is_blank(raw) {
        return Value::Null;
    }
    match kind {
        FieldKind::String => match raw {
            Value::String(s) => {
                let joined = s
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect::<Vec<_>>()
                    .join(", ");
                Value::String(joined)
            }
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            _ => Value::Null,
        },
        FieldKind::Currency | FieldKind::OptionalCurrency => match raw {
            Value::Number(_) => raw.clone(),
            Value::String(s) => parse_currency(s).map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldKind::Checkbox => match raw {
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            Value::String(s) => Value::Bool(matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "y" | "1" | "x" | "checked" | "[x]"
            )),
            _ => Value::Null,
        },
        FieldKind::LineItems => match raw {
            Value::Array(_) => raw.clone(),
            Value::Object(_) => Value::Array(vec![raw.clone()]),
            Value::Number(_) => Value::Array(vec![serde_json::json!({ "amount": raw })]),
            _ => Value::Null,
        },
    }
}

/// `"$1,234.50"` → `1234.5`; `"(300)"` → `-300`; `"12.5%"` → `12.5`.
pub fn parse_currency(s: &str) -> Option<f64> {
    let t = s.trim();
    let (negative, inner) = match t.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, t),
    };
    let digits: String = inner
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' ' | '%'))
        .collect();
    let n: f64 = digits.parse().ok()?;
    if !n.is_finite() {
        return None;
    }
    Some(if negative { -n.abs() } else { n })
}

// ── Canonical rendering ──────────────────────────────────────────────────

/// Render records in the schema's canonical JSON shape.
///
/// With no records this is the template sent to the model.
pub fn canonical_json(schema: &FormSchema, forms: &[NormalizedForm]) -> Value {
    let template;
    let forms = if forms.is_empty() {
        template = [NormalizedForm::empty(schema)];
        &template[..]
    } else {
        forms
    };

    let metadata_map = |form: &NormalizedForm| -> Map<String, Value> {
        form.metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };

    let records: Vec<Map<String, Value>> = forms
        .iter()
        .map(|form| {
            let mut record = Map::new();
            if schema.header_key.is_none() {
                record.extend(metadata_map(form));
            }
            if let Some(identity) = &schema.identity {
                record.insert(
                    identity.code.clone(),
                    form.identity.clone().map(Value::String).unwrap_or(Value::Null),
                );
            }
            let mut parts = Vec::new();
            for (spec, plane) in schema.planes.iter().zip(&form.planes) {
                let entries: Vec<Value> = plane
                    .fields
                    .iter()
                    .map(|f| serde_json::json!({ "code": f.code, "label": f.label, "value": f.value }))
                    .collect();
                match spec.layout {
                    PlaneLayout::DataRows => {
                        record.insert(
                            plane.name.clone(),
                            serde_json::json!([{ "data": entries }]),
                        );
                    }
                    PlaneLayout::Flat => {
                        record.insert(plane.name.clone(), Value::Array(entries));
                    }
                    PlaneLayout::Part => parts.push(serde_json::json!({
                        "part_number": spec.part_number,
                        "label": spec.label,
                        "fields": entries,
                    })),
                }
            }
            if !parts.is_empty() {
                record.insert("parts".into(), Value::Array(parts));
            }
            record
        })
        .collect();

    let mut root = Map::new();
    if let Some(header) = &schema.header_key {
        root.insert(header.clone(), Value::Object(metadata_map(&forms[0])));
    }
    match &schema.records_key {
        Some(key) => {
            root.insert(
                key.clone(),
                Value::Array(records.into_iter().map(Value::Object).collect()),
            );
        }
        None => {
            if let Some(first) = records.into_iter().next() {
                root.extend(first);
            }
        }
    }
    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::SchemaRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn schema(ft: FormType) -> Arc<FormSchema> {
        SchemaRegistry::embedded().unwrap().get(ft).unwrap()
    }

    #[test]
    fn strips_json_fences() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{}\n```\n"), "{}");
        assert_eq!(strip_fences("  {}  "), "{}");
    }

    #[test]
    fn non_json_keeps_raw_text() {
        let raw = "I'm sorry, the image is too blurry to read.";
        let err = normalize(raw, &schema(FormType::W2)).unwrap_err();
        assert_eq!(err.raw, raw);
    }

    #[test]
    fn json_inside_prose_is_recovered() {
        let raw = "Here is the data:\n{\"forms\": [{\"box_1\": \"100\"}]}\nThanks";
        let forms = normalize(raw, &schema(FormType::Form1099Int)).unwrap();
        assert_eq!(forms[0].value("financial_plane", "1"), Some(&json!(100.0)));
    }

    #[test]
    fn empty_object_is_schema_complete() {
        for ft in FormType::ALL {
            let s = schema(ft);
            let forms = normalize("{}", &s).unwrap();
            assert_eq!(forms.len(), 1, "{ft}");
            assert_eq!(forms[0].field_count(), s.field_count(), "{ft}");
            assert_eq!(forms[0].metadata.len(), s.metadata.len(), "{ft}");
        }
    }

    #[test]
    fn defaults_follow_field_kind() {
        let forms = normalize("{}", &schema(FormType::Form1099Int)).unwrap();
        let f = &forms[0];
        assert_eq!(f.value("financial_plane", "1"), Some(&json!(0.0)));
        assert_eq!(f.value("financial_plane", "6"), Some(&Value::Null));
        assert_eq!(f.value("identification_plane", "FATCA"), Some(&json!(false)));
        assert_eq!(f.value("identification_plane", "Payer"), Some(&Value::Null));
    }

    #[test]
    fn alias_pass_cleans_values() {
        let raw = r#"{"forms": [{
            "payer_name": "ACME BANK\n123 Main St",
            "box_1_interest": "$1,234.56",
            "box_2": "(12.00)",
            "fatca_filing": "X",
            "state_tax": "N/A"
        }]}"#;
        let forms = normalize(raw, &schema(FormType::Form1099Int)).unwrap();
        let f = &forms[0];
        assert_eq!(
            f.value("identification_plane", "Payer"),
            Some(&json!("ACME BANK, 123 Main St"))
        );
        assert_eq!(f.value("financial_plane", "1"), Some(&json!(1234.56)));
        assert_eq!(f.value("financial_plane", "2"), Some(&json!(-12.0)));
        assert_eq!(f.value("identification_plane", "FATCA"), Some(&json!(true)));
        assert_eq!(f.value("state_local_plane", "17"), Some(&json!(0.0)));
    }

    #[test]
    fn earlier_alias_wins() {
        // Both "box_1" and "interest_income" are aliases of box 1; "box_1" is listed first.
        let raw = r#"{"interest_income": 5, "box_1": 7}"#;
        let forms = normalize(raw, &schema(FormType::Form1099Int)).unwrap();
        assert_eq!(forms[0].value("financial_plane", "1"), Some(&json!(7)));
    }

    #[test]
    fn box_one_does_not_match_box_ten() {
        let raw = r#"{"box_10": 99}"#;
        let forms = normalize(raw, &schema(FormType::Form1099Int)).unwrap();
        assert_eq!(forms[0].value("financial_plane", "1"), Some(&json!(0.0)));
        assert_eq!(forms[0].value("financial_plane", "10"), Some(&json!(99)));
    }

    #[test]
    fn combine_with_joins_name_and_address() {
        let raw = r#"{"employer_name": "Widget Co", "employer_address": "1 Road, Town"}"#;
        let forms = normalize(raw, &schema(FormType::W2)).unwrap();
        assert_eq!(
            forms[0].value("identification_plane", "c"),
            Some(&json!("Widget Co, 1 Road, Town"))
        );
    }

    #[test]
    fn label_alias_sets_box_12_code() {
        let raw = r#"{"box_12a_code": "D", "box_12a_amount": "1500"}"#;
        let forms = normalize(raw, &schema(FormType::W2)).unwrap();
        let plane = forms[0]
            .planes
            .iter()
            .find(|p| p.name == "supplemental_plane")
            .unwrap();
        let b12a = plane.fields.iter().find(|f| f.code == "12a").unwrap();
        assert_eq!(b12a.label, "D");
        assert_eq!(b12a.value, json!(1500.0));
    }

    #[test]
    fn records_split_and_metadata_from_root() {
        let raw = r#"{
            "document_metadata": {"tax_year": "2024", "partnership_name": "Fund LP"},
            "partner_records": [
                {"partner_name": "Alice", "page_number": 3},
                {"partner_name": "Bob", "page_number": 4}
            ]
        }"#;
        let forms = normalize(raw, &schema(FormType::ScheduleK1)).unwrap();
        assert_eq!(forms.len(), 2);
        assert_eq!(forms[0].identity.as_deref(), Some("Alice"));
        assert_eq!(forms[1].identity.as_deref(), Some("Bob"));
        assert_eq!(forms[1].source_page, Some(4));
        assert_eq!(forms[1].metadata["tax_year"], json!("2024"));
        assert_eq!(forms[0].metadata["partnership_name"], json!("Fund LP"));
    }

    #[test]
    fn empty_record_array_yields_one_default_record() {
        let forms = normalize(r#"{"forms": []}"#, &schema(FormType::W2)).unwrap();
        assert_eq!(forms.len(), 1);
        let forms = normalize("[]", &schema(FormType::W2)).unwrap();
        assert_eq!(forms.len(), 1);
    }

    #[test]
    fn part_layout_reads_matching_part_numbers() {
        let raw = r#"{"parts": [
            {"part_number": "II", "fields": [{"code": "2a", "value": "Agent LLC"}]},
            {"part_number": "I", "fields": [{"code": "2a", "value": "wrong part"}]}
        ]}"#;
        let s = schema(FormType::Form8804);
        let forms = normalize(raw, &s).unwrap();
        assert_eq!(forms[0].value("part_ii", "2a"), Some(&json!("Agent LLC")));
        assert_eq!(forms[0].value("part_ii", "2b"), Some(&Value::Null));
        assert_eq!(forms[0].field_count(), s.field_count());
    }

    #[test]
    fn canonical_input_is_a_value_no_op() {
        let s = schema(FormType::ScheduleK3);
        let raw = r#"{
            "document_metadata": {"tax_year": "2024", "partnership_name": "Global Fund LP"},
            "partner_records": [{
                "partner_name": "Jane Doe",
                "part_i_other_international": [{"data": [{"code": "1", "value": 125.5}]}]
            }]
        }"#;
        let first = normalize(raw, &s).unwrap();
        let rendered = canonical_json(&s, &first).to_string();
        let second = normalize(&rendered, &s).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            second[0].value("part_i_other_international", "1"),
            Some(&json!(125.5))
        );
    }

    #[test]
    fn template_has_every_box() {
        let s = schema(FormType::Form8805);
        let template = canonical_json(&s, &[]);
        let flat_entries = template["fields"].as_array().unwrap();
        assert_eq!(flat_entries.len(), s.plane("fields").unwrap().fields.len());
        assert!(template.get("partner_name").is_some());
    }

    #[test]
    fn currency_parsing() {
        assert_eq!(parse_currency("$1,000.00"), Some(1000.0));
        assert_eq!(parse_currency("(250)"), Some(-250.0));
        assert_eq!(parse_currency("-$75"), Some(-75.0));
        assert_eq!(parse_currency("12.5%"), Some(12.5));
        assert_eq!(parse_currency("see statement"), None);
    }

    #[test]
    fn checkbox_coercion() {
        for yes in ["true", "Yes", "1", "x", "CHECKED"] {
            assert_eq!(clean_value(FieldKind::Checkbox, &json!(yes)), json!(true), "{yes}");
        }
        assert_eq!(clean_value(FieldKind::Checkbox, &json!("no")), json!(false));
        assert_eq!(clean_value(FieldKind::Checkbox, &json!(0)), json!(false));
    }

    #[test]
    fn line_items_wrap_single_objects() {
        let v = clean_value(FieldKind::LineItems, &json!({"code": "A", "amount": 10}));
        assert_eq!(v, json!([{"code": "A", "amount": 10}]));
    }

    #[test]
    fn plane_object_keyed_by_alias() {
        let raw = r#"{"forms": [{"financial_plane": {"box_1": "50.25", "4": 3}}]}"#;
        let forms = normalize(raw, &schema(FormType::Form1099Int)).unwrap();
        assert_eq!(forms[0].value("financial_plane", "1"), Some(&json!(50.25)));
        assert_eq!(forms[0].value("financial_plane", "4"), Some(&json!(3)));
    }

    #[test]
    fn wrapped_records_with_boxed_planes_pass_through() {
        let raw = r#"[{"forms":[{"form_header":{"tax_year":"2024"},
            "boxes":[{"financial_plane":[{"data":[{"code":"1","value":100}]}]}]}]}]"#;
        let forms = normalize(raw, &schema(FormType::Form1099Int)).unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].value("financial_plane", "1"), Some(&json!(100)));
        assert_eq!(forms[0].metadata.get("tax_year"), Some(&json!("2024")));
    }

    #[test]
    fn records_from_several_wrappers_are_joined() {
        let raw = r#"[{"forms":[{"box_1":"10"}]},{"forms":[{"box_1":"20"}]}]"#;
        let forms = normalize(raw, &schema(FormType::Form1099Int)).unwrap();
        assert_eq!(forms.len(), 2);
        assert_eq!(forms[1].value("financial_plane", "1"), Some(&json!(20.0)));
    }

    #[test]
    fn scalar_payload_is_a_parse_error() {
        assert!(normalize("42", &schema(FormType::W2)).is_err());
    }
}
