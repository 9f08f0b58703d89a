//! The closed set of tax forms the pipeline knows how to segment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A supported IRS form type.
///
/// The serialised form (`"K-1"`, `"1099-INT"`, …) is the short identifier used
/// in schema files, CLI flags and the JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FormType {
    /// Schedule K-1 (Form 1065), partner's share of income.
    #[serde(rename = "K-1")]
    ScheduleK1,
    /// Schedule K-3 (Form 1065), partner's share of international items.
    #[serde(rename = "K-3")]
    ScheduleK3,
    /// Form 8804 and its Schedule K-1, partnership withholding tax.
    #[serde(rename = "8804")]
    Form8804,
    /// Form 8805, foreign partner's information statement.
    #[serde(rename = "8805")]
    Form8805,
    #[serde(rename = "W-2")]
    W2,
    #[serde(rename = "1099-INT")]
    Form1099Int,
    #[serde(rename = "1099-NEC")]
    Form1099Nec,
    #[serde(rename = "1099-MISC")]
    Form1099Misc,
}

impl FormType {
    pub const ALL: [FormType; 8] = [
        FormType::ScheduleK1,
        FormType::ScheduleK3,
        FormType::Form8804,
        FormType::Form8805,
        FormType::W2,
        FormType::Form1099Int,
        FormType::Form1099Nec,
        FormType::Form1099Misc,
    ];

    /// Short identifier, identical to the serde representation.
    pub fn id(self) -> &'static str {
        match self {
            FormType::ScheduleK1 => "K-1",
            FormType::ScheduleK3 => "K-3",
            FormType::Form8804 => "8804",
            FormType::Form8805 => "8805",
            FormType::W2 => "W-2",
            FormType::Form1099Int => "1099-INT",
            FormType::Form1099Nec => "1099-NEC",
            FormType::Form1099Misc => "1099-MISC",
        }
    }

    /// Human-readable title as printed on the form.
    pub fn title(self) -> &'static str {
        match self {
            FormType::ScheduleK1 => "Schedule K-1 (Form 1065)",
            FormType::ScheduleK3 => "Schedule K-3 (Form 1065)",
            FormType::Form8804 => "Form 8804",
            FormType::Form8805 => "Form 8805",
            FormType::W2 => "Form W-2 Wage and Tax Statement",
            FormType::Form1099Int => "Form 1099-INT Interest Income",
            FormType::Form1099Nec => "Form 1099-NEC Nonemployee Compensation",
            FormType::Form1099Misc => "Form 1099-MISC Miscellaneous Information",
        }
    }

    /// Detect a form type from filename tokens.
    ///
    /// Used when a page has no text layer (scanned images). Lower confidence
    /// than text signatures; the check order mirrors how specific each token
    /// is, so `"1099-INT"` wins over the generic `"1099"` fallback.
    pub fn from_filename(filename: &str) -> Option<FormType> {
        let name = filename.to_ascii_uppercase();
        let has_variant = |suffix: &str| {
            ["-", " ", "_", ""]
                .iter()
                .any(|sep| name.contains(&format!("1099{sep}{suffix}")))
        };

        if name.contains("W2") || name.contains("W-2") {
            return Some(FormType::W2);
        }
        if has_variant("INT") {
            return Some(FormType::Form1099Int);
        }
        if has_variant("NEC") {
            return Some(FormType::Form1099Nec);
        }
        if has_variant("MISC") {
            return Some(FormType::Form1099Misc);
        }
        // Combined brokerage statements from this issuer are interest forms.
        if name.contains("ALLY") && name.contains("1099") {
            return Some(FormType::Form1099Int);
        }
        if name.contains("1099") {
            return Some(FormType::Form1099Misc);
        }
        if name.contains("K-1")
            || name.contains("K1")
            || name.contains("1065")
            || name.contains("SCHEDULE K")
        {
            return Some(FormType::ScheduleK1);
        }
        if name.contains("8805") || name.contains("SECTION 1446") || name.contains("FOREIGN PARTNER")
        {
            return Some(FormType::Form8805);
        }
        if name.contains("8804") || name.contains("PARTNERSHIP WITHHOLDING") {
            return Some(FormType::Form8804);
        }
        None
    }
}

impl fmt::Display for FormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for FormType {
    type Err = String;

    /// Accepts the short identifier in any case, with or without the hyphen
    /// (`"k1"`, `"K-1"`, `"w2"`, `"1099int"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        let key = key.strip_prefix("FORM").unwrap_or(&key).to_string();
        let key = key.strip_prefix("SCHEDULE").unwrap_or(&key).to_string();
        match key.as_str() {
            "K1" => Ok(FormType::ScheduleK1),
            "K3" => Ok(FormType::ScheduleK3),
            "8804" => Ok(FormType::Form8804),
            "8805" => Ok(FormType::Form8805),
            "W2" => Ok(FormType::W2),
            "1099INT" => Ok(FormType::Form1099Int),
            "1099NEC" => Ok(FormType::Form1099Nec),
            "1099MISC" => Ok(FormType::Form1099Misc),
            _ => Err(format!(
                "unknown form type '{s}' (expected one of: {})",
                FormType::ALL.map(FormType::id).join(", ")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_variants_of_1099_int() {
        for name in ["1099-INT.pdf", "1099INT.png", "bank 1099 int.jpg", "x_1099_INT.pdf"] {
            assert_eq!(FormType::from_filename(name), Some(FormType::Form1099Int), "{name}");
        }
    }

    #[test]
    fn generic_1099_defaults_to_misc() {
        assert_eq!(FormType::from_filename("statement-1099.pdf"), Some(FormType::Form1099Misc));
        assert_eq!(FormType::from_filename("ally_1099_2024.pdf"), Some(FormType::Form1099Int));
    }

    #[test]
    fn filename_partnership_forms() {
        assert_eq!(FormType::from_filename("smith_k1.pdf"), Some(FormType::ScheduleK1));
        assert_eq!(FormType::from_filename("Foreign Partner stmt.pdf"), Some(FormType::Form8805));
        assert_eq!(FormType::from_filename("form8804.pdf"), Some(FormType::Form8804));
        assert_eq!(FormType::from_filename("scan0001.png"), None);
    }

    #[test]
    fn w2_wins_over_everything() {
        assert_eq!(FormType::from_filename("w2_and_1099.pdf"), Some(FormType::W2));
    }

    #[test]
    fn parse_short_ids() {
        assert_eq!("k1".parse::<FormType>().unwrap(), FormType::ScheduleK1);
        assert_eq!("Schedule K-3".parse::<FormType>().unwrap(), FormType::ScheduleK3);
        assert_eq!("Form 8805".parse::<FormType>().unwrap(), FormType::Form8805);
        assert_eq!("1099-int".parse::<FormType>().unwrap(), FormType::Form1099Int);
        assert!("1040".parse::<FormType>().is_err());
    }

    #[test]
    fn serde_uses_short_ids() {
        let json = serde_json::to_string(&FormType::Form1099Int).unwrap();
        assert_eq!(json, "\"1099-INT\"");
        let back: FormType = serde_json::from_str("\"K-3\"").unwrap();
        assert_eq!(back, FormType::ScheduleK3);
    }
}
