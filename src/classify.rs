//! Page classification by text signatures.
//!
//! Every supported form type has a [`Signature`]: terms that must all be
//! present, alternative groups of which at least one must match, and
//! signatures of conflicting forms that must *not* match. Rules are checked
//! in a fixed precedence order and every rule is evaluated, so a page that
//! satisfies two of them is reported as [`Classification::Ambiguous`] rather
//! than silently taking whichever rule happened to run first.
//!
//! ## Why exclusions?
//!
//! The partnership forms quote each other. A Schedule K-1 (Form 8804) says
//! "Schedule K-1"; a Form 8805 cites "Section 1446" like an 8804 does; the
//! K-3 instructions mention the K-1. Plain keyword search sends those pages
//! to the wrong extractor, so each partnership signature names the
//! signatures it must not overlap with.
//!
//! Pages without a text layer (scans, photos) fall back to filename tokens
//! via [`FormType::from_filename`].

use crate::forms::FormType;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ── Signatures ───────────────────────────────────────────────────────────

/// Structured predicate over page text.
#[derive(Debug)]
pub struct Signature {
    /// Every term must occur.
    pub all: &'static [&'static str],
    /// At least one nested signature must match (ignored when empty).
    pub any: &'static [&'static Signature],
    /// None of these may match.
    pub none: &'static [&'static Signature],
    /// Compare upper-cased text. Partnership forms use exact casing.
    pub ignore_case: bool,
}

impl Signature {
    pub fn matches(&self, text: &PageText<'_>) -> bool {
        let haystack = if self.ignore_case { text.upper.as_str() } else { text.raw };
        let contains = |term: &str| {
            if self.ignore_case {
                haystack.contains(&term.to_ascii_uppercase())
            } else {
                haystack.contains(term)
            }
        };
        self.all.iter().all(|t| contains(t))
            && (self.any.is_empty() || self.any.iter().any(|s| s.matches(text)))
            && !self.none.iter().any(|s| s.matches(text))
    }
}

const fn terms(all: &'static [&'static str]) -> Signature {
    Signature {
        all,
        any: &[],
        none: &[],
        ignore_case: false,
    }
}

const fn terms_nocase(all: &'static [&'static str]) -> Signature {
    Signature {
        all,
        any: &[],
        none: &[],
        ignore_case: true,
    }
}

// Identification marks, used both as building blocks and as exclusions.
const SCHEDULE_K1: Signature = terms(&["Schedule K-1"]);
const K1_1065_HEADER: Signature = terms(&["Schedule K-1", "(Form 1065)"]);
const K3_MARK: Signature = terms(&["Schedule K-3"]);
const K1_8804: Signature = terms(&["Schedule K-1", "(Form 8804)"]);
const PARTNER_1446_TITLE: Signature = terms(&["Partner's Section 1446 Withholding Tax"]);
const MAIN_8804_TITLE: Signature = terms(&["Annual Return for Partnership Withholding Tax"]);
const MAIN_8804_PARTS: Signature =
    terms(&["Part I", "Partnership", "Part II", "Withholding Agent"]);
const MAIN_8804: Signature = Signature {
    all: &["Form 8804"],
    any: &[&MAIN_8804_TITLE, &MAIN_8804_PARTS],
    none: &[&SCHEDULE_K1],
    ignore_case: false,
};
const ANY_8804_MARK: Signature = Signature {
    all: &[],
    any: &[
        &K1_8804,
        &terms(&["Form 8804", "Annual Return for Partnership Withholding Tax"]),
        &terms(&["Form 8804", "Schedule K-1"]),
    ],
    none: &[],
    ignore_case: false,
};
const F8805_MARK: Signature = Signature {
    all: &[],
    any: &[
        &terms(&["Form 8805"]),
        &terms(&["Foreign Partner's Information Statement"]),
    ],
    none: &[],
    ignore_case: false,
};
const COPY_8805: Signature = Signature {
    all: &["8805"],
    any: &[
        &terms(&["Copy A"]),
        &terms(&["Copy B"]),
        &terms(&["Copy C"]),
        &terms(&["Copy D"]),
    ],
    none: &[],
    ignore_case: false,
};

/// K-1 (Form 1065) start page: header plus the Part I marker.
pub const K1_START: Signature = Signature {
    all: &["Schedule K-1", "(Form 1065)", "Part I", "Information About the Partnership"],
    any: &[],
    none: &[],
    ignore_case: false,
};

pub const K3: Signature = Signature {
    all: &["Schedule K-3"],
    any: &[],
    none: &[&SCHEDULE_K1],
    ignore_case: false,
};

pub const F8804: Signature = Signature {
    all: &[],
    any: &[&K1_8804, &PARTNER_1446_TITLE, &MAIN_8804],
    none: &[&K1_1065_HEADER, &F8805_MARK, &K3_MARK],
    ignore_case: false,
};

pub const F8805: Signature = Signature {
    all: &[],
    any: &[&F8805_MARK, &COPY_8805],
    none: &[&ANY_8804_MARK, &K1_1065_HEADER, &K3_MARK],
    ignore_case: false,
};

pub const W2: Signature = terms_nocase(&["Wage and Tax Statement", "W-2"]);

pub const F1099_INT: Signature = Signature {
    all: &[],
    any: &[
        &terms_nocase(&["1099-INT"]),
        &terms_nocase(&["1099INT"]),
        &terms_nocase(&["Interest Income", "1099"]),
    ],
    none: &[],
    ignore_case: true,
};

pub const F1099_NEC: Signature = Signature {
    all: &[],
    any: &[&terms_nocase(&["1099-NEC"]), &terms_nocase(&["1099NEC"])],
    none: &[],
    ignore_case: true,
};

pub const F1099_MISC: Signature = Signature {
    all: &[],
    any: &[&terms_nocase(&["1099-MISC"]), &terms_nocase(&["1099MISC"])],
    none: &[],
    ignore_case: true,
};

/// A form type with its signature, in precedence order.
pub struct SignatureRule {
    pub form_type: FormType,
    pub signature: &'static Signature,
}

/// Evaluation order. Earlier rules win ambiguous pages under
/// [`AmbiguityPolicy::Precedence`].
pub static RULES: [SignatureRule; 8] = [
    SignatureRule { form_type: FormType::ScheduleK1, signature: &K1_START },
    SignatureRule { form_type: FormType::ScheduleK3, signature: &K3 },
    SignatureRule { form_type: FormType::Form8804, signature: &F8804 },
    SignatureRule { form_type: FormType::Form8805, signature: &F8805 },
    SignatureRule { form_type: FormType::W2, signature: &W2 },
    SignatureRule { form_type: FormType::Form1099Int, signature: &F1099_INT },
    SignatureRule { form_type: FormType::Form1099Nec, signature: &F1099_NEC },
    SignatureRule { form_type: FormType::Form1099Misc, signature: &F1099_MISC },
];

/// Page text in both casings, computed once per page.
pub struct PageText<'a> {
    raw: &'a str,
    upper: String,
}

impl<'a> PageText<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self {
            raw,
            upper: raw.to_ascii_uppercase(),
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────

/// Result of classifying one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    /// The page starts or continues an instance of this form.
    Form { form_type: FormType },
    /// The page carries the form's header but not its start marker; it only
    /// extends an already open range of the same type.
    Continuation { form_type: FormType },
    Unknown,
    /// Several mutually exclusive signatures matched. `chosen` is the first
    /// candidate in precedence order.
    Ambiguous {
        chosen: FormType,
        candidates: Vec<FormType>,
    },
}

impl Classification {
    /// The form type this page contributes to range detection, if any.
    pub fn form_type(&self) -> Option<FormType> {
        match self {
            Classification::Form { form_type } => Some(*form_type),
            Classification::Ambiguous { chosen, .. } => Some(*chosen),
            Classification::Continuation { .. } | Classification::Unknown => None,
        }
    }
}

/// What to do with a page that matches more than one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Take the first candidate in precedence order (logged).
    #[default]
    Precedence,
    /// Treat the page as unknown (logged).
    Reject,
}

/// Classify one page by its text.
///
/// Returns [`Classification::Ambiguous`] unresolved; the document-level
/// [`Classifier`] applies the [`AmbiguityPolicy`].
pub fn classify(page_text: &str) -> Classification {
    let text = PageText::new(page_text);
    let candidates: Vec<FormType> = RULES
        .iter()
        .filter(|rule| rule.signature.matches(&text))
        .map(|rule| rule.form_type)
        .collect();

    match candidates.as_slice() {
        [] if K1_1065_HEADER.matches(&text) => Classification::Continuation {
            form_type: FormType::ScheduleK1,
        },
        [] => Classification::Unknown,
        [only] => Classification::Form { form_type: *only },
        [first, ..] => Classification::Ambiguous {
            chosen: *first,
            candidates,
        },
    }
}

/// One classified page (1-based index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageClassification {
    pub page: usize,
    pub classification: Classification,
}

/// Document-level classification settings.
#[derive(Debug, Clone)]
pub struct Classifier {
    pub policy: AmbiguityPolicy,
    /// Percentage of leading pages in which K-1 start pages are accepted.
    /// Trailing pages of partnership packages are blank instruction copies.
    pub k1_scan_percent: u32,
    /// Forces every page to this form type.
    pub form_override: Option<FormType>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            policy: AmbiguityPolicy::default(),
            k1_scan_percent: 85,
            form_override: None,
        }
    }
}

impl Classifier {
    /// Classify every page of a document.
    ///
    /// `texts[i]` is the text of page `i + 1`. `filename` is consulted for
    /// pages with no text layer.
    pub fn classify_pages(&self, texts: &[&str], filename: &str) -> Vec<PageClassification> {
        let total = texts.len();
        let k1_limit = (total * self.k1_scan_percent as usize / 100).max(1);

        texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let page = i + 1;
                let classification = self.classify_one(page, text, filename, k1_limit);
                debug!("Page {page}: {classification:?}");
                PageClassification {
                    page,
                    classification,
                }
            })
            .collect()
    }

    fn classify_one(
        &self,
        page: usize,
        text: &str,
        filename: &str,
        k1_limit: usize,
    ) -> Classification {
        if let Some(form_type) = self.form_override {
            return Classification::Form { form_type };
        }

        if text.trim().is_empty() {
            return match FormType::from_filename(filename) {
                Some(form_type) => Classification::Form { form_type },
                None => Classification::Unknown,
            };
        }

        let classification = classify(text);

        if page > k1_limit
            && matches!(
                classification,
                Classification::Form { form_type: FormType::ScheduleK1 }
                    | Classification::Continuation { form_type: FormType::ScheduleK1 }
            )
        {
            debug!("Page {page}: K-1 page past the scan limit ({k1_limit}), ignored");
            return Classification::Unknown;
        }

        if let Classification::Ambiguous { chosen, candidates } = &classification {
            match self.policy {
                AmbiguityPolicy::Precedence => warn!(
                    "Page {page}: ambiguous classification {candidates:?}, using {chosen}"
                ),
                AmbiguityPolicy::Reject => {
                    warn!("Page {page}: ambiguous classification {candidates:?}, page skipped");
                    return Classification::Unknown;
                }
            }
        }
        classification
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const K1_PAGE: &str = "651121 Final K-1 Schedule K-1 (Form 1065) 2024 \
        Partner's Share of Income, Deductions, Credits, etc. \
        Part I Information About the Partnership A Partnership's EIN";

    fn form(t: FormType) -> Classification {
        Classification::Form { form_type: t }
    }

    #[test]
    fn k1_start_page() {
        assert_eq!(classify(K1_PAGE), form(FormType::ScheduleK1));
    }

    #[test]
    fn k1_header_without_part_i_is_continuation() {
        let text = "Schedule K-1 (Form 1065) 2024 Supplemental Information Box 20 code Z";
        assert_eq!(
            classify(text),
            Classification::Continuation {
                form_type: FormType::ScheduleK1
            }
        );
    }

    #[test]
    fn k3_when_k1_absent() {
        let text = K1_PAGE.replace("Schedule K-1", "Schedule K-3");
        assert_eq!(classify(&text), form(FormType::ScheduleK3));
    }

    #[test]
    fn k3_mentioning_k1_is_not_k3() {
        let text = "Schedule K-3 2024, see the Schedule K-1 instructions";
        assert_eq!(classify(text), Classification::Unknown);
    }

    #[test]
    fn schedule_k1_form_8804_is_8804() {
        let text = "Schedule K-1 (Form 8804) Partner's Section 1446 Withholding Tax 2024";
        assert_eq!(classify(text), form(FormType::Form8804));
    }

    #[test]
    fn main_8804_by_parts() {
        let text = "Form 8804 2024 Part I Partnership name Part II Withholding Agent";
        assert_eq!(classify(text), form(FormType::Form8804));
    }

    #[test]
    fn form_8804_without_title_or_parts_is_unknown() {
        assert_eq!(classify("see Form 8804 instructions"), Classification::Unknown);
    }

    #[test]
    fn form_8805_not_confused_with_8804() {
        let text = "Form 8805 Foreign Partner's Information Statement of Section 1446 Withholding Tax Copy A";
        assert_eq!(classify(text), form(FormType::Form8805));
    }

    #[test]
    fn copy_marker_with_8805_number() {
        let text = "Copy B for partner, attach to 8805 filings";
        assert_eq!(classify(text), form(FormType::Form8805));
    }

    #[test]
    fn w2_and_1099_case_insensitive() {
        assert_eq!(classify("form w-2 wage and tax statement 2024"), form(FormType::W2));
        assert_eq!(classify("FORM 1099-NEC"), form(FormType::Form1099Nec));
        assert_eq!(classify("Interest Income Form 1099"), form(FormType::Form1099Int));
    }

    #[test]
    fn two_signatures_are_ambiguous() {
        let text = "W-2 Wage and Tax Statement ... Form 1099-MISC";
        assert_eq!(
            classify(text),
            Classification::Ambiguous {
                chosen: FormType::W2,
                candidates: vec![FormType::W2, FormType::Form1099Misc],
            }
        );
    }

    #[test]
    fn reject_policy_turns_ambiguous_into_unknown() {
        let classifier = Classifier {
            policy: AmbiguityPolicy::Reject,
            ..Default::default()
        };
        let pages = classifier.classify_pages(&["W-2 Wage and Tax Statement 1099-MISC"], "x.pdf");
        assert_eq!(pages[0].classification, Classification::Unknown);

        let pages = Classifier::default()
            .classify_pages(&["W-2 Wage and Tax Statement 1099-MISC"], "x.pdf");
        assert_eq!(pages[0].classification.form_type(), Some(FormType::W2));
    }

    #[test]
    fn empty_text_uses_filename() {
        let pages = Classifier::default().classify_pages(&["", "  "], "client_W2_2024.pdf");
        assert!(pages.iter().all(|p| p.classification == form(FormType::W2)));
        let pages = Classifier::default().classify_pages(&[""], "scan0001.png");
        assert_eq!(pages[0].classification, Classification::Unknown);
    }

    #[test]
    fn k1_pages_past_scan_limit_are_ignored() {
        let texts: Vec<&str> = std::iter::repeat(K1_PAGE).take(20).collect();
        let pages = Classifier::default().classify_pages(&texts, "k1.pdf");
        assert_eq!(pages[16].classification, form(FormType::ScheduleK1));
        assert_eq!(pages[17].classification, Classification::Unknown);
        assert_eq!(pages[19].classification, Classification::Unknown);
    }

    #[test]
    fn override_forces_every_page() {
        let classifier = Classifier {
            form_override: Some(FormType::Form1099Int),
            ..Default::default()
        };
        let pages = classifier.classify_pages(&["random", ""], "a.pdf");
        assert!(pages
            .iter()
            .all(|p| p.classification == form(FormType::Form1099Int)));
    }
}
