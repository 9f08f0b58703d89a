//! Merge per-page normalised records into one record per form instance.
//!
//! | Strategy | Result |
//! |----------|--------|
//! | `FirstPage` | each record passes through, referenced by the whole range |
//! | `Batch` | each record passes through, referenced by its own page |
//! | `MergeRange` | every page folds into one record for the range |
//! | `PerPage` | records are grouped by partner identity, each group folds |
//!
//! Folding is field by field in page order: the first value wins unless it
//! is empty (`null`, `""`, `"N/A"`, `0`, `false`, `[]`), in which case a later
//! non-empty value replaces it.

use crate::forms::ExtractionStrategy;
use crate::pipeline::normalize::{is_blank, NormalizedForm};
use crate::ranges::FormRange;
use serde_json::Value;
use tracing::debug;

/// Normalised records from one backend call.
#[derive(Debug, Clone)]
pub struct PageResult {
    /// Pages sent in the call, ascending.
    pub pages: Vec<usize>,
    pub forms: Vec<NormalizedForm>,
}

/// One consolidated form instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Consolidated {
    pub form: NormalizedForm,
    /// `"7"`, `"2-11"`, or `"3-4, 7"` for a partner seen on scattered pages.
    pub page_reference: String,
}

/// True for values that a later page may overwrite.
pub fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        other => is_blank(other),
    }
}

/// Fold `other` into `target`, keeping every non-empty value of `target`.
pub fn merge_into(target: &mut NormalizedForm, other: &NormalizedForm) {
    if target.identity.is_none() {
        target.identity = other.identity.clone();
    }
    if target.source_page.is_none() {
        target.source_page = other.source_page;
    }

    for (key, value) in &other.metadata {
        let slot = target.metadata.entry(key.clone()).or_insert(Value::Null);
        if is_empty_value(slot) && !is_empty_value(value) {
            *slot = value.clone();
        }
    }

    for (plane, incoming) in target.planes.iter_mut().zip(&other.planes) {
        for (field, new) in plane.fields.iter_mut().zip(&incoming.fields) {
            if is_empty_value(&field.value) && !is_empty_value(&new.value) {
                field.value = new.value.clone();
                if !new.label.is_empty() {
                    field.label = new.label.clone();
                }
            }
        }
    }
}

/// Lowercase, alphanumerics only, single spaces. `"DOE, JANE  "` and
/// `"Doe Jane"` are the same partner.
pub fn identity_key(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render pages as contiguous runs: `[3, 4, 7]` → `"3-4, 7"`.
pub fn format_pages(pages: &[usize]) -> String {
    let mut sorted = pages.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<(usize, usize)> = Vec::new();
    for p in sorted {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == p => *end = p,
            _ => runs.push((p, p)),
        }
    }
    runs.iter()
        .map(|&(s, e)| if s == e { s.to_string() } else { format!("{s}-{e}") })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Consolidate the results of one range under `strategy`.
///
/// `results` must be in page order. Returns nothing only when `results`
/// holds no records at all.
pub fn consolidate(
    range: &FormRange,
    strategy: ExtractionStrategy,
    results: Vec<PageResult>,
) -> Vec<Consolidated> {
    let out = match strategy {
        ExtractionStrategy::FirstPage => results
            .into_iter()
            .flat_map(|r| r.forms)
            .map(|form| Consolidated {
                form,
                page_reference: range.page_reference(),
            })
            .collect(),
        ExtractionStrategy::Batch => results
            .into_iter()
            .flat_map(|r| {
                let chunk_ref = format_pages(&r.pages);
                let pages = r.pages;
                r.forms.into_iter().map(move |form| {
                    let page_reference = match form.source_page {
                        Some(p) if pages.contains(&p) => p.to_string(),
                        _ => chunk_ref.clone(),
                    };
                    Consolidated {
                        form,
                        page_reference,
                    }
                })
            })
            .collect(),
        ExtractionStrategy::MergeRange => merge_range(range, results).into_iter().collect(),
        ExtractionStrategy::PerPage => group_by_identity(results),
    };
    debug!("{range}: {} consolidated record(s)", out.len());
    out
}

fn merge_range(range: &FormRange, results: Vec<PageResult>) -> Option<Consolidated> {
    let mut forms = results.into_iter().flat_map(|r| r.forms);
    let mut merged = forms.next()?;
    for form in forms {
        merge_into(&mut merged, &form);
    }
    if merged.identity.is_none() {
        merged.identity = Some(format!(
            "Partner (Pages {}-{})",
            range.start_page, range.end_page
        ));
    }
    Some(Consolidated {
        form: merged,
        page_reference: range.page_reference(),
    })
}

/// Group records by partner. A record with no identity belongs to the
/// partner of the record before it (a continuation page).
fn group_by_identity(results: Vec<PageResult>) -> Vec<Consolidated> {
    struct Group {
        key: String,
        form: NormalizedForm,
        pages: Vec<usize>,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut current: Option<usize> = None;

    for result in results {
        for form in result.forms {
            let pages = match form.source_page {
                Some(p) => vec![p],
                None => result.pages.clone(),
            };
            let key = form
                .identity
                .as_deref()
                .map(identity_key)
                .filter(|k| !k.is_empty());

            let existing = match &key {
                Some(key) => groups.iter().position(|g| &g.key == key),
                None => current,
            };

            match existing {
                Some(i) => {
                    merge_into(&mut groups[i].form, &form);
                    groups[i].pages.extend(pages);
                    current = Some(i);
                }
                None => {
                    groups.push(Group {
                        key: key.unwrap_or_default(),
                        form,
                        pages,
                    });
                    current = Some(groups.len() - 1);
                }
            }
        }
    }

    groups
        .into_iter()
        .map(|g| Consolidated {
            page_reference: format_pages(&g.pages),
            form: g.form,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::{FormType, SchemaRegistry};
    use serde_json::json;

    fn k1() -> std::sync::Arc<crate::forms::FormSchema> {
        SchemaRegistry::embedded()
            .unwrap()
            .get(FormType::ScheduleK1)
            .unwrap()
    }

    fn form_with(identity: Option<&str>, page: Option<usize>, box_a: Value) -> NormalizedForm {
        let mut f = NormalizedForm::empty(&k1());
        f.identity = identity.map(str::to_string);
        f.source_page = page;
        f.planes[0].fields[0].value = box_a;
        f
    }

    fn box_a(f: &NormalizedForm) -> &Value {
        &f.planes[0].fields[0].value
    }

    #[test]
    fn empty_values() {
        for v in [json!(null), json!(""), json!("N/A"), json!(0), json!(0.0), json!(false), json!([])] {
            assert!(is_empty_value(&v), "{v}");
        }
        for v in [json!("5"), json!(1.5), json!(true), json!([{"code": "A"}])] {
            assert!(!is_empty_value(&v), "{v}");
        }
    }

    #[test]
    fn later_value_fills_empty_slot() {
        let mut a = form_with(None, None, Value::Null);
        merge_into(&mut a, &form_with(None, None, json!("5")));
        assert_eq!(box_a(&a), &json!("5"));
    }

    #[test]
    fn first_value_wins() {
        let mut a = form_with(None, None, json!("5"));
        merge_into(&mut a, &form_with(None, None, json!("9")));
        assert_eq!(box_a(&a), &json!("5"));
    }

    #[test]
    fn metadata_from_first_non_empty_page() {
        let mut a = form_with(None, None, Value::Null);
        let mut b = a.clone();
        let mut c = a.clone();
        b.metadata.insert("tax_year".into(), json!("2024"));
        c.metadata.insert("tax_year".into(), json!("2023"));
        merge_into(&mut a, &b);
        merge_into(&mut a, &c);
        assert_eq!(a.metadata["tax_year"], json!("2024"));
    }

    #[test]
    fn identity_keys_ignore_case_and_punctuation() {
        assert_eq!(identity_key("DOE, JANE  "), identity_key("doe jane"));
        assert_ne!(identity_key("Jane Doe"), identity_key("John Doe"));
    }

    #[test]
    fn page_formatting() {
        assert_eq!(format_pages(&[7]), "7");
        assert_eq!(format_pages(&[2, 3, 4]), "2-4");
        assert_eq!(format_pages(&[7, 3, 4]), "3-4, 7");
    }

    #[test]
    fn per_page_groups_partners_and_continuations() {
        let range = FormRange::new(FormType::ScheduleK1, 3, 6);
        let results = vec![
            PageResult { pages: vec![3], forms: vec![form_with(Some("Jane Doe"), None, json!("12-3456789"))] },
            PageResult { pages: vec![4], forms: vec![form_with(None, None, Value::Null)] },
            PageResult { pages: vec![5], forms: vec![form_with(Some("John Roe"), None, Value::Null)] },
            PageResult { pages: vec![6], forms: vec![form_with(Some("JANE DOE"), None, json!("99-9999999"))] },
        ];
        let out = consolidate(&range, ExtractionStrategy::PerPage, results);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].form.identity.as_deref(), Some("Jane Doe"));
        assert_eq!(out[0].page_reference, "3-4, 6");
        assert_eq!(box_a(&out[0].form), &json!("12-3456789"));
        assert_eq!(out[1].page_reference, "5");
    }

    #[test]
    fn merge_range_folds_everything_and_names_anonymous_partner() {
        let range = FormRange::new(FormType::ScheduleK3, 2, 11);
        let results = (2..=11)
            .map(|p| PageResult {
                pages: vec![p],
                forms: vec![form_with(None, None, if p == 5 { json!("X") } else { Value::Null })],
            })
            .collect();
        let out = consolidate(&range, ExtractionStrategy::MergeRange, results);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].page_reference, "2-11");
        assert_eq!(box_a(&out[0].form), &json!("X"));
        assert_eq!(out[0].form.identity.as_deref(), Some("Partner (Pages 2-11)"));
    }

    #[test]
    fn batch_uses_source_page_when_inside_chunk() {
        let range = FormRange::new(FormType::W2, 1, 3);
        let results = vec![PageResult {
            pages: vec![1, 2, 3],
            forms: vec![
                form_with(None, Some(2), Value::Null),
                form_with(None, Some(40), Value::Null),
            ],
        }];
        let out = consolidate(&range, ExtractionStrategy::Batch, results);
        assert_eq!(out[0].page_reference, "2");
        assert_eq!(out[1].page_reference, "1-3");
    }

    #[test]
    fn first_page_references_whole_range() {
        let range = FormRange::new(FormType::Form8805, 2, 5);
        let results = vec![PageResult {
            pages: vec![2],
            forms: vec![form_with(Some("A"), None, Value::Null)],
        }];
        let out = consolidate(&range, ExtractionStrategy::FirstPage, results);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].page_reference, "2-5");
    }
}
