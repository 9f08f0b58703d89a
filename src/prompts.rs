//! Extraction prompts for vision models.
//!
//! Every prompt has the same three layers:
//!
//! 1. **Preamble**: role and the general rules for reading tax forms.
//! 2. **Form layer**: the schema's own instructions and the canonical JSON
//!    template rendered from the schema, so the model sees every box code
//!    it must fill and the exact shape to return.
//! 3. **Page note**: which document pages the attached images are.
//!
//! Keeping the template generated from the schema means a revised schema
//! file changes the prompt with it; there is no second copy to drift.

use crate::forms::FormSchema;
use crate::pipeline::consolidate::format_pages;
use crate::pipeline::normalize::canonical_json;

/// Role and reading rules shared by every form type.
pub const EXTRACTION_PREAMBLE: &str = r#"You are an expert at reading U.S. tax forms. Extract every box from the attached form image(s) into JSON.

Follow these rules precisely:

1. VALUES
   - Copy text exactly as printed; join multi-line names and addresses with ", "
   - Amounts are plain numbers: no $ sign, no thousands separators
   - Amounts printed in parentheses are negative numbers
   - Checkboxes are true when marked and false otherwise
   - Leave a box at its template value when it is blank or illegible; never guess

2. SHAPE
   - Return exactly the structure of the template below
   - Keep every "code" and "label" as given; fill in "value" only
   - Do not add or remove boxes"#;

/// Closing rules about the response format.
pub const OUTPUT_RULES: &str = r#"OUTPUT FORMAT
   - Output ONLY the JSON object
   - Do NOT wrap it in ```json fences
   - Do NOT add commentary or explanations"#;

/// Build the full prompt for one backend call covering `pages`.
pub fn extraction_prompt(schema: &FormSchema, pages: &[usize]) -> String {
    let template = serde_json::to_string_pretty(&canonical_json(schema, &[]))
        .unwrap_or_else(|_| "{}".to_string());

    let mut prompt = String::with_capacity(EXTRACTION_PREAMBLE.len() + template.len() + 512);
    prompt.push_str(EXTRACTION_PREAMBLE);
    prompt.push_str("\n\n");
    prompt.push_str(&format!(
        "FORM: {} ({})\n",
        schema.form_type.title(),
        schema.title
    ));
    for line in &schema.instructions {
        prompt.push_str("   - ");
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(&page_note(schema, pages));
    prompt.push_str("\n\nTEMPLATE\n");
    prompt.push_str(&template);
    prompt.push_str("\n\n");
    prompt.push_str(OUTPUT_RULES);
    prompt
}

fn page_note(schema: &FormSchema, pages: &[usize]) -> String {
    let page_field = if schema.records_key.is_some() {
        " Set \"page_number\" on each record to the page it was read from."
    } else {
        ""
    };
    match pages {
        [] => String::new(),
        [only] => format!("PAGES\n   The image is page {only} of the document.{page_field}"),
        many => format!(
            "PAGES\n   The {} images are pages {} of the document, in order.{page_field}",
            many.len(),
            format_pages(many)
        ),
    }
}
