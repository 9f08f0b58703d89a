//! Grouping classified pages into form-instance ranges.

use crate::classify::{Classification, PageClassification};
use crate::forms::FormType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Contiguous pages holding one instance (or one batch of instances) of a
/// form type. Pages are 1-based and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormRange {
    pub form_type: FormType,
    pub start_page: usize,
    pub end_page: usize,
}

impl FormRange {
    pub fn new(form_type: FormType, start_page: usize, end_page: usize) -> Self {
        Self {
            form_type,
            start_page,
            end_page,
        }
    }

    pub fn page_count(&self) -> usize {
        self.end_page - self.start_page + 1
    }

    pub fn pages(&self) -> impl Iterator<Item = usize> {
        self.start_page..=self.end_page
    }

    /// `"7"` for a single page, `"2-11"` for a span.
    pub fn page_reference(&self) -> String {
        if self.start_page == self.end_page {
            self.start_page.to_string()
        } else {
            format!("{}-{}", self.start_page, self.end_page)
        }
    }
}

impl fmt::Display for FormRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pages {}", self.form_type, self.page_reference())
    }
}

/// Group classified pages into maximal contiguous same-type runs.
///
/// A page extends the open range when it has the same form type and
/// immediately follows it; anything else closes the range. A
/// [`Classification::Continuation`] page extends an open range of its type
/// and is dropped otherwise. Input must be in ascending page order, which
/// is also the output order.
pub fn detect_ranges(pages: &[PageClassification]) -> Vec<FormRange> {
    let mut ranges: Vec<FormRange> = Vec::new();
    let mut open: Option<FormRange> = None;

    for entry in pages {
        let page = entry.page;
        let (form_type, starts_range) = match &entry.classification {
            Classification::Continuation { form_type } => (Some(*form_type), false),
            other => (other.form_type(), true),
        };

        let extends = match (open.as_ref(), form_type) {
            (Some(r), Some(t)) => r.form_type == t && page == r.end_page + 1,
            _ => false,
        };

        if extends {
            if let Some(r) = open.as_mut() {
                r.end_page = page;
            }
            continue;
        }

        if let Some(r) = open.take() {
            ranges.push(r);
        }
        if let (Some(t), true) = (form_type, starts_range) {
            open = Some(FormRange::new(t, page, page));
        }
    }

    if let Some(r) = open {
        ranges.push(r);
    }
    ranges
}
