//! Defensive extraction of payloads from OCR and LLM response envelopes.
//!
//! Both services are schemaless at the transport level. We never assume a
//! key is present; instead we probe a fixed list of candidate locations and
//! fall back to scraping the first balanced JSON value out of free text.
//! Shape validation happens once, here and in the stage schemas; downstream
//! code works with typed records.

use crate::{errors::{ErrorCode, PipelineError}, prelude::*};

/// A single OCR'd page.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OcrPage {
    pub page_number: u32,
    pub text: String,
}

/// Filtered OCR output: pages sorted by number, duplicates merged, empty
/// text dropped.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct OcrPages {
    pub pages: Vec<OcrPage>,
}

impl OcrPages {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The JSON string injected into prompt templates.
    pub fn to_prompt_payload(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize OCR pages")
    }
}

/// Walk an OCR response of unknown shape and normalize it.
///
/// Collects every object that carries a page number and a text field,
/// wherever it sits in the response tree. Duplicate page numbers are merged
/// by concatenation in document order.
pub fn filter_ocr_pages(raw: &Value) -> OcrPages {
    let mut collected: Vec<(u32, String)> = Vec::new();
    collect_pages(raw, &mut collected);

    let mut merged: Vec<(u32, String)> = Vec::new();
    for (number, text) in collected {
        match merged.iter_mut().find(|(n, _)| *n == number) {
            Some((_, existing)) => {
                existing.push('\n');
                existing.push_str(&text);
            }
            None => merged.push((number, text)),
        }
    }
    merged.retain(|(_, text)| !text.trim().is_empty());
    merged.sort_by_key(|(number, _)| *number);

    OcrPages {
        pages: merged
            .into_iter()
            .map(|(page_number, text)| OcrPage { page_number, text })
            .collect(),
    }
}

fn collect_pages(value: &Value, out: &mut Vec<(u32, String)>) {
    match value {
        Value::Object(map) => {
            let number = map
                .get("page_number")
                .or_else(|| map.get("page"))
                .and_then(Value::as_u64);
            let text = map.get("text").and_then(Value::as_str);
            if let (Some(number), Some(text)) = (number, text) {
                out.push((number as u32, text.to_owned()));
                return;
            }
            for child in map.values() {
                collect_pages(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_pages(child, out);
            }
        }
        _ => {}
    }
}

/// Does this value look like an echo of our own completion request?
///
/// Some gateway configurations reflect the request object back inside the
/// response; such a value must never be mistaken for the payload.
fn is_prompt_echo(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.contains_key("Model") && map.contains_key("Content"))
}

/// Extract the JSON payload out of an LLM response envelope.
///
/// Candidate locations, in order: `choices[0].message.content`,
/// `choices[0].text`, then a root-level `content` (legacy shapes). String
/// candidates are parsed as JSON, unwrapping code fences and surrounding
/// prose if needed.
pub fn extract_llm_payload(envelope: &Value) -> Result<Value, PipelineError> {
    let first_choice = envelope
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first());
    let candidates = [
        first_choice.and_then(|choice| choice.pointer("/message/content")),
        first_choice.and_then(|choice| choice.get("text")),
        envelope.get("content"),
    ];

    for candidate in candidates.into_iter().flatten() {
        if is_prompt_echo(candidate) {
            continue;
        }
        match candidate {
            Value::String(text) => {
                if let Some(payload) = parse_json_snippet(text) {
                    if is_prompt_echo(&payload) {
                        continue;
                    }
                    return Ok(payload);
                }
            }
            // Some gateways hand the payload back pre-parsed.
            Value::Object(_) | Value::Array(_) => return Ok(candidate.clone()),
            _ => {}
        }
    }

    Err(PipelineError::new(
        ErrorCode::LlmFilterParseError,
        "no JSON payload found in LLM response envelope",
    ))
}

/// Parse a string as JSON, tolerating code fences and surrounding prose.
fn parse_json_snippet(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    // Strip a Markdown code fence, if any.
    if let Some(inner) = strip_code_fence(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            return Some(value);
        }
    }

    // Last resort: the first balanced `{...}` or `[...]` substring.
    let snippet = balanced_json_substring(trimmed)?;
    serde_json::from_str::<Value>(snippet).ok()
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    // Skip an optional language tag on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    let end = rest.rfind("```")?;
    Some(rest[..end].trim())
}

/// Find the first balanced top-level JSON object or array in `text`,
/// respecting string literals and escapes.
fn balanced_json_substring(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_with_content(content: &str) -> Value {
        json!({"choices": [{"message": {"content": content}}]})
    }

    #[test]
    fn test_primary_location() {
        let envelope = envelope_with_content(r#"{"doc_type": "medical_conclusion"}"#);
        let payload = extract_llm_payload(&envelope).unwrap();
        assert_eq!(payload["doc_type"], "medical_conclusion");
    }

    #[test]
    fn test_legacy_choice_text() {
        let envelope = json!({"choices": [{"text": r#"{"fio": "Иванов Иван"}"#}]});
        let payload = extract_llm_payload(&envelope).unwrap();
        assert_eq!(payload["fio"], "Иванов Иван");
    }

    #[test]
    fn test_legacy_root_content() {
        let envelope = json!({"content": r#"{"ok": true}"#});
        assert_eq!(extract_llm_payload(&envelope).unwrap()["ok"], true);
    }

    #[test]
    fn test_code_fence() {
        let envelope = envelope_with_content(
            "```json\n{\"doc_type\": null, \"single_doc_type_valid\": true}\n```",
        );
        let payload = extract_llm_payload(&envelope).unwrap();
        assert_eq!(payload["single_doc_type_valid"], true);
    }

    #[test]
    fn test_surrounding_prose() {
        let envelope = envelope_with_content(
            "Вот результат анализа: {\"fio\": \"Петров Петр\", \"doc_date\": \"2025-01-15\"} — конец.",
        );
        let payload = extract_llm_payload(&envelope).unwrap();
        assert_eq!(payload["doc_date"], "2025-01-15");
    }

    #[test]
    fn test_braces_inside_strings() {
        let envelope =
            envelope_with_content(r#"noise {"note": "curly } inside", "n": 1} tail"#);
        let payload = extract_llm_payload(&envelope).unwrap();
        assert_eq!(payload["n"], 1);
    }

    #[test]
    fn test_skips_prompt_echo() {
        // The gateway reflected our own request as the root content; the
        // real payload sits in the primary location.
        let envelope = json!({
            "choices": [{"message": {"content": r#"{"fio": "Иванов Иван"}"#}}],
            "content": {"Model": "m", "Content": "prompt text"},
        });
        let payload = extract_llm_payload(&envelope).unwrap();
        assert_eq!(payload["fio"], "Иванов Иван");
    }

    #[test]
    fn test_echo_only_is_an_error() {
        let envelope = json!({"content": {"Model": "m", "Content": "prompt"}});
        let err = extract_llm_payload(&envelope).unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmFilterParseError);
    }

    #[test]
    fn test_echo_inside_string_is_rejected() {
        let envelope =
            envelope_with_content(r#"{"Model": "m", "Content": "echoed prompt"}"#);
        assert!(extract_llm_payload(&envelope).is_err());
    }

    #[test]
    fn test_garbage_is_an_error() {
        let envelope = envelope_with_content("no json here at all");
        assert!(extract_llm_payload(&envelope).is_err());
    }

    #[test]
    fn test_idempotent_on_canonical_json() {
        let payload = json!({"fio": "Иванов Иван", "doc_date": "2025-03-01"});
        let extracted =
            extract_llm_payload(&envelope_with_content(&payload.to_string())).unwrap();
        let rewrapped = envelope_with_content(&extracted.to_string());
        assert_eq!(extract_llm_payload(&rewrapped).unwrap(), extracted);
    }

    #[test]
    fn test_ocr_filter_sorts_and_drops_empty() {
        let raw = json!({
            "result": {
                "pages": [
                    {"page_number": 2, "text": "вторая"},
                    {"page_number": 1, "text": "первая"},
                    {"page_number": 3, "text": "   "},
                ]
            }
        });
        let pages = filter_ocr_pages(&raw);
        assert_eq!(
            pages.pages,
            vec![
                OcrPage { page_number: 1, text: "первая".to_owned() },
                OcrPage { page_number: 2, text: "вторая".to_owned() },
            ]
        );
    }

    #[test]
    fn test_ocr_filter_merges_duplicates_in_document_order() {
        let raw = json!([
            {"page": 1, "text": "верх"},
            {"page": 1, "text": "низ"},
        ]);
        let pages = filter_ocr_pages(&raw);
        assert_eq!(pages.pages.len(), 1);
        assert_eq!(pages.pages[0].text, "верх\nниз");
    }

    #[test]
    fn test_ocr_filter_empty_response() {
        assert!(filter_ocr_pages(&json!({"status": "done"})).is_empty());
    }
}
