//! System prompts for the two LLM-facing stages.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — the instruction contract is the only
//!    correctness lever over a non-deterministic model, so it lives in
//!    exactly one place.
//!
//! 2. **Testability** — unit tests inspect the prompts directly without a
//!    live model, making contract regressions easy to catch.
//!
//! Callers can override the extraction prompt via
//! [`crate::config::IngestConfig::system_prompt`]; the builders here are used
//! only when no override is provided.

use crate::fields::CanonicalFieldSet;

/// Build the extraction system prompt for a field set.
///
/// The prompt (a) enumerates every key in canonical order, (b) fixes `""` as
/// the value for missing data, (c) demands a bare JSON object with string
/// values and English ASCII keys whatever the card's language.
pub fn extraction_system_prompt(fields: &CanonicalFieldSet) -> String {
    let key_list = fields
        .iter()
        .map(|k| format!("\"{k}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let template = fields
        .iter()
        .map(|k| format!("  \"{k}\": \"\""))
        .collect::<Vec<_>>()
        .join(",\n");

    format!(
        r#"You are a business card data extractor. The user message is raw OCR text from one business card.

Follow these rules precisely:

1. KEYS
   - Return a JSON object with exactly these keys, in this order: {key_list}
   - Use these English ASCII key names even when the card is in another language
   - Do NOT add, rename or omit keys

2. VALUES
   - Every value is a JSON string
   - Copy text as it appears on the card; do not translate or reformat it
   - If the card does not contain a value for a key, use the empty string ""
   - Never use null, numbers, arrays or nested objects

3. OUTPUT FORMAT
   - Output ONLY the JSON object
   - Do NOT wrap it in ```json fences
   - Do NOT add commentary or explanations

Template:
{{
{template}
}}"#
    )
}

/// Build the user message carrying the recognized text.
pub fn extraction_user_message(text: &str) -> String {
    format!("OCR text:\n\"\"\"\n{text}\n\"\"\"")
}

/// System prompt for transcribing a card image with a vision model.
pub const RECOGNITION_SYSTEM_PROMPT: &str = r#"You are an OCR engine. Transcribe ALL text visible in the business card image.

Rules:
- Preserve the original language and script; do not translate
- One visual line per output line, in reading order
- Output ONLY the transcribed text, no commentary
- If the image contains no readable text, output nothing"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_every_key_in_order() {
        let fields = CanonicalFieldSet::default();
        let prompt = extraction_system_prompt(&fields);
        let mut last = 0;
        for key in fields.iter() {
            let needle = format!("\"{key}\"");
            let pos = prompt.find(&needle).unwrap_or_else(|| panic!("missing {key}"));
            assert!(pos >= last, "{key} out of order");
            last = pos;
        }
    }

    #[test]
    fn prompt_states_empty_string_default_and_json_only() {
        let prompt = extraction_system_prompt(&CanonicalFieldSet::default());
        assert!(prompt.contains("use the empty string \"\""));
        assert!(prompt.contains("Output ONLY the JSON object"));
        assert!(prompt.contains("English ASCII"));
    }

    #[test]
    fn template_is_valid_json() {
        let prompt = extraction_system_prompt(&CanonicalFieldSet::default());
        let start = prompt.rfind("{\n").unwrap();
        let template: serde_json::Value = serde_json::from_str(&prompt[start..]).unwrap();
        assert_eq!(template.as_object().unwrap().len(), 7);
    }

    #[test]
    fn user_message_embeds_text() {
        let msg = extraction_user_message("山田太郎");
        assert!(msg.contains("山田太郎"));
    }
}
