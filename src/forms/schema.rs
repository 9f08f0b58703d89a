//! Canonical per-form schemas and the versioned registry that serves them.
//!
//! A schema is the single source of truth for one form type: which planes
//! exist, which box codes each plane holds, how each value is typed and
//! defaulted, which keys a drifting model might use instead (aliases), and
//! how the pages of one form instance are sent to the model (strategy).
//!
//! Schemas live in `schemas/*.json` and are indexed by `schemas/registry.json`:
//!
//! ```json
//! { "forms": { "K-3": { "current_version": "2024.1",
//!                       "versions": { "2024.1": "k3.2024.json" } } } }
//! ```
//!
//! The shipped set is embedded at compile time. [`SchemaRegistry::load_dir`]
//! reads the same layout from disk, which lets operators roll out a revised
//! schema without rebuilding.

use crate::error::TaxFormError;
use crate::forms::FormType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// ── Field model ──────────────────────────────────────────────────────────

/// Value type of a box, which decides both coercion and the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text. Default `null`.
    String,
    /// Dollar amount. Default `0.00`.
    Currency,
    /// Dollar amount that is left `null` when the box is blank.
    OptionalCurrency,
    /// Check box. Default `false`.
    Checkbox,
    /// Coded line items (`[{"code": "A", "amount": 12.0}]`). Default `[]`.
    LineItems,
}

impl FieldKind {
    pub fn default_value(self) -> Value {
        match self {
            FieldKind::String | FieldKind::OptionalCurrency => Value::Null,
            FieldKind::Currency => Value::from(0.0_f64),
            FieldKind::Checkbox => Value::Bool(false),
            FieldKind::LineItems => Value::Array(Vec::new()),
        }
    }
}

/// One box on the form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub code: String,
    pub label: String,
    pub kind: FieldKind,
    /// Ordered key fragments tried when the model drifts from the canonical
    /// shape. Earlier aliases win.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Second alias list whose value is appended to the first (name + address).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combine_with: Vec<String>,
    /// Separator for `combine_with`. Default `", "`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    /// Aliases whose value replaces the label (W-2 box 12 letter codes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_aliases: Vec<String>,
    /// Overrides the kind's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn default_value(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| self.kind.default_value())
    }
}

/// How a plane is laid out in the JSON the model is asked to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaneLayout {
    /// `"name": [ { "data": [ {code, label, value} ] }, … ]`
    #[default]
    DataRows,
    /// `"name": [ {code, label, value}, … ]`
    Flat,
    /// `"parts": [ { "part_number": "I", "label": …, "fields": [ … ] } ]`
    Part,
}

/// A named group of boxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Roman part number for [`PlaneLayout::Part`] planes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_number: Option<String>,
    #[serde(default)]
    pub layout: PlaneLayout,
    pub fields: Vec<FieldSpec>,
}

/// How the pages of one detected form range are sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// One call per page; records are grouped by partner identity afterwards.
    PerPage,
    /// One call per page, issued in page order and merged into one record.
    MergeRange,
    /// Only the first page of the range is extracted (the rest are copies).
    FirstPage,
    /// All pages go out as multi-image calls of at most `batch_size` images.
    Batch,
}

/// The canonical schema of one form type at one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSchema {
    pub form_type: FormType,
    pub version: String,
    pub title: String,
    pub strategy: ExtractionStrategy,
    /// Key of the document-level header object in canonical output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_key: Option<String>,
    /// Key of the record array for forms that can hold several instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_key: Option<String>,
    /// Identity used to group records of multi-entity documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<FieldSpec>,
    /// Extra prompt lines specific to this form.
    #[serde(default)]
    pub instructions: Vec<String>,
    /// Header-level fields hoisted into the document metadata.
    #[serde(default)]
    pub metadata: Vec<FieldSpec>,
    pub planes: Vec<PlaneSpec>,
}

impl FormSchema {
    /// Parse and validate a schema document.
    pub fn from_json(name: &str, json: &str) -> Result<Self, TaxFormError> {
        let schema: FormSchema =
            serde_json::from_str(json).map_err(|e| TaxFormError::InvalidSchema {
                name: name.to_string(),
                detail: e.to_string(),
            })?;
        schema.validate(name)?;
        Ok(schema)
    }

    /// Number of boxes over all planes.
    pub fn field_count(&self) -> usize {
        self.planes.iter().map(|p| p.fields.len()).sum()
    }

    pub fn plane(&self, name: &str) -> Option<&PlaneSpec> {
        self.planes.iter().find(|p| p.name == name)
    }

    fn validate(&self, name: &str) -> Result<(), TaxFormError> {
        let invalid = |detail: String| TaxFormError::InvalidSchema {
            name: name.to_string(),
            detail,
        };

        if self.planes.is_empty() {
            return Err(invalid("schema defines no planes".into()));
        }

        let mut plane_names = HashSet::new();
        for plane in &self.planes {
            if !plane_names.insert(plane.name.as_str()) {
                return Err(invalid(format!("duplicate plane '{}'", plane.name)));
            }
            if plane.fields.is_empty() {
                return Err(invalid(format!("plane '{}' has no fields", plane.name)));
            }
            if plane.layout == PlaneLayout::Part && plane.part_number.is_none() {
                return Err(invalid(format!(
                    "plane '{}' uses the part layout but has no part_number",
                    plane.name
                )));
            }
            let mut codes = HashSet::new();
            for field in &plane.fields {
                if !codes.insert(field.code.as_str()) {
                    return Err(invalid(format!(
                        "duplicate box code '{}' in plane '{}'",
                        field.code, plane.name
                    )));
                }
            }
        }

        let mut meta = HashSet::new();
        for field in &self.metadata {
            if !meta.insert(field.code.as_str()) {
                return Err(invalid(format!("duplicate metadata key '{}'", field.code)));
            }
        }
        Ok(())
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegistryFile {
    forms: BTreeMap<String, RegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    current_version: String,
    versions: BTreeMap<String, String>,
}

const EMBEDDED_REGISTRY: &str = include_str!("../../schemas/registry.json");

const EMBEDDED_SCHEMAS: &[(&str, &str)] = &[
    ("k1.2024.json", include_str!("../../schemas/k1.2024.json")),
    ("k3.2024.json", include_str!("../../schemas/k3.2024.json")),
    ("f8804.2024.json", include_str!("../../schemas/f8804.2024.json")),
    ("f8805.2024.json", include_str!("../../schemas/f8805.2024.json")),
    ("w2.2024.json", include_str!("../../schemas/w2.2024.json")),
    ("1099int.2024.json", include_str!("../../schemas/1099int.2024.json")),
    ("1099nec.2024.json", include_str!("../../schemas/1099nec.2024.json")),
    ("1099misc.2024.json", include_str!("../../schemas/1099misc.2024.json")),
];

/// Every registered schema version, with the current version per form type.
///
/// Built once and shared behind an `Arc`; lookups hand out `Arc<FormSchema>`
/// so concurrent ranges never copy schema data.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    versions: HashMap<FormType, BTreeMap<String, Arc<FormSchema>>>,
    current: HashMap<FormType, String>,
}

impl SchemaRegistry {
    /// The schema set compiled into the binary.
    pub fn embedded() -> Result<Self, TaxFormError> {
        Self::from_registry(EMBEDDED_REGISTRY, |file| {
            EMBEDDED_SCHEMAS
                .iter()
                .find(|(name, _)| *name == file)
                .map(|(_, json)| json.to_string())
                .ok_or_else(|| TaxFormError::InvalidSchema {
                    name: file.to_string(),
                    detail: "referenced by registry.json but not embedded".into(),
                })
        })
    }

    /// Load `registry.json` and the schema files it references from `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, TaxFormError> {
        let registry_path = dir.join("registry.json");
        let registry = std::fs::read_to_string(&registry_path).map_err(|e| {
            TaxFormError::SchemaIo {
                path: registry_path.clone(),
                source: e,
            }
        })?;
        info!("Loading schema registry from {}", dir.display());
        Self::from_registry(&registry, |file| {
            let path = dir.join(file);
            std::fs::read_to_string(&path).map_err(|e| TaxFormError::SchemaIo { path, source: e })
        })
    }

    fn from_registry(
        registry_json: &str,
        mut read: impl FnMut(&str) -> Result<String, TaxFormError>,
    ) -> Result<Self, TaxFormError> {
        let file: RegistryFile =
            serde_json::from_str(registry_json).map_err(|e| TaxFormError::InvalidSchema {
                name: "registry.json".into(),
                detail: e.to_string(),
            })?;

        let mut registry = SchemaRegistry::default();
        for (key, entry) in file.forms {
            let form_type: FormType =
                key.parse().map_err(|detail| TaxFormError::InvalidSchema {
                    name: "registry.json".into(),
                    detail,
                })?;

            if !entry.versions.contains_key(&entry.current_version) {
                return Err(TaxFormError::InvalidSchema {
                    name: "registry.json".into(),
                    detail: format!(
                        "{key}: current_version '{}' is not listed in versions",
                        entry.current_version
                    ),
                });
            }

            for (version, path) in &entry.versions {
                let schema = FormSchema::from_json(path, &read(path)?)?;
                if schema.form_type != form_type || &schema.version != version {
                    return Err(TaxFormError::InvalidSchema {
                        name: path.clone(),
                        detail: format!(
                            "registered as {key} v{version} but declares {} v{}",
                            schema.form_type, schema.version
                        ),
                    });
                }
                debug!(
                    "Registered schema {} v{} ({} boxes)",
                    form_type,
                    version,
                    schema.field_count()
                );
                registry
                    .versions
                    .entry(form_type)
                    .or_default()
                    .insert(version.clone(), Arc::new(schema));
            }
            registry.current.insert(form_type, entry.current_version);
        }
        Ok(registry)
    }

    /// Current schema for `form_type`.
    pub fn get(&self, form_type: FormType) -> Result<Arc<FormSchema>, TaxFormError> {
        let version = self
            .current
            .get(&form_type)
            .ok_or(TaxFormError::SchemaNotFound { form_type })?;
        self.get_version(form_type, version)
    }

    /// A specific schema version, e.g. to re-run an old extraction.
    pub fn get_version(
        &self,
        form_type: FormType,
        version: &str,
    ) -> Result<Arc<FormSchema>, TaxFormError> {
        self.versions
            .get(&form_type)
            .and_then(|v| v.get(version))
            .cloned()
            .ok_or(TaxFormError::SchemaNotFound { form_type })
    }

    pub fn contains(&self, form_type: FormType) -> bool {
        self.current.contains_key(&form_type)
    }

    /// Form types with a registered schema.
    pub fn form_types(&self) -> Vec<FormType> {
        let mut types: Vec<FormType> = self.current.keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_registry_loads_every_shipped_form() {
        let registry = SchemaRegistry::embedded().expect("embedded registry is valid");
        for ft in FormType::ALL {
            assert!(registry.contains(ft), "missing {ft}");
        }
        assert_eq!(registry.form_types().len(), FormType::ALL.len());
    }

    #[test]
    fn k3_has_thirteen_parts() {
        let registry = SchemaRegistry::embedded().unwrap();
        let k3 = registry.get(FormType::ScheduleK3).unwrap();
        assert_eq!(k3.planes.len(), 13);
        assert_eq!(k3.strategy, ExtractionStrategy::MergeRange);
        let part_ii = k3.plane("part_ii_foreign_tax_credit").unwrap();
        assert!(part_ii.fields.iter().any(|f| f.code == "55g"));
    }

    #[test]
    fn strategies_match_form_behaviour() {
        let registry = SchemaRegistry::embedded().unwrap();
        let strategy = |ft| registry.get(ft).unwrap().strategy;
        assert_eq!(strategy(FormType::ScheduleK1), ExtractionStrategy::PerPage);
        assert_eq!(strategy(FormType::Form8805), ExtractionStrategy::FirstPage);
        assert_eq!(strategy(FormType::Form8804), ExtractionStrategy::FirstPage);
        assert_eq!(strategy(FormType::W2), ExtractionStrategy::Batch);
    }

    #[test]
    fn missing_schema_is_an_error() {
        let registry = SchemaRegistry::embedded().unwrap();
        let err = registry.get_version(FormType::Form1099Misc, "1999.1").unwrap_err();
        assert!(matches!(err, TaxFormError::SchemaNotFound { .. }));
    }

    #[test]
    fn duplicate_codes_are_rejected() {
        let json = r#"{
            "form_type": "W-2", "version": "x", "title": "t", "strategy": "batch",
            "planes": [{ "name": "p", "fields": [
                { "code": "1", "label": "a", "kind": "currency" },
                { "code": "1", "label": "b", "kind": "currency" }
            ]}]
        }"#;
        let err = FormSchema::from_json("dup.json", json).unwrap_err();
        assert!(err.to_string().contains("duplicate box code"), "{err}");
    }

    #[test]
    fn load_dir_reads_external_registry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("registry.json"),
            r#"{ "forms": { "1099-NEC": { "current_version": "1",
                 "versions": { "1": "nec.json" } } } }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("nec.json"),
            r#"{ "form_type": "1099-NEC", "version": "1", "title": "Nonemployee Compensation",
                 "strategy": "batch",
                 "planes": [{ "name": "financial_plane", "fields": [
                     { "code": "1", "label": "Nonemployee compensation", "kind": "currency",
                       "aliases": ["box_1", "nonemployee_compensation"] }
                 ]}] }"#,
        )
        .unwrap();

        let registry = SchemaRegistry::load_dir(dir.path()).unwrap();
        let nec = registry.get(FormType::Form1099Nec).unwrap();
        assert_eq!(nec.field_count(), 1);
        assert_eq!(registry.form_types(), vec![FormType::Form1099Nec]);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("registry.json"),
            r#"{ "forms": { "W-2": { "current_version": "2",
                 "versions": { "2": "w2.json" } } } }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("w2.json"),
            r#"{ "form_type": "W-2", "version": "1", "title": "t", "strategy": "batch",
                 "planes": [{ "name": "p", "fields": [
                     { "code": "1", "label": "a", "kind": "currency" } ]}] }"#,
        )
        .unwrap();
        assert!(SchemaRegistry::load_dir(dir.path()).is_err());
    }
}
