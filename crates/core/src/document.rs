//! Tagged container for JSON crossing a trust boundary.
//!
//! The transformation subprocess contract is inherently dynamic: arbitrary
//! JSON in, arbitrary JSON out. Rather than threading a loosely-typed value
//! through the whole pipeline, the boundary validates shape once and wraps
//! the payload in [`UntrustedDocument`]; downstream code can only read it
//! through narrow accessors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

/// Cap on the text derived from a document for embedding; anything beyond
/// this adds cost without improving the search signal.
const MAX_SEARCHABLE_TEXT_LEN: usize = 16_384;

/// An opaque JSON object produced by an external collaborator.
///
/// The only structural guarantee is that the top level is a JSON object;
/// everything else is read defensively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UntrustedDocument(Value);

impl UntrustedDocument {
    /// Validate raw bytes from an external process into a document.
    pub fn from_json_str(raw: &str) -> Result<Self, DomainError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| DomainError::malformed_document(format!("not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Validate an already-parsed value into a document.
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        if !value.is_object() {
            return Err(DomainError::malformed_document(
                "top-level value must be a JSON object",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Read a top-level string field, if present.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Derive the searchable text for embedding.
    ///
    /// Collects every string leaf in document order, joined by newlines and
    /// capped at [`MAX_SEARCHABLE_TEXT_LEN`]. Returns `None` when the document
    /// contains no usable text; the caller treats that as a skip, not a
    /// failure.
    pub fn searchable_text(&self) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        collect_strings(&self.0, &mut parts);

        let mut text = String::new();
        for part in parts {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            let separator = usize::from(!text.is_empty());
            if text.len() + separator + trimmed.len() > MAX_SEARCHABLE_TEXT_LEN {
                let budget = MAX_SEARCHABLE_TEXT_LEN.saturating_sub(text.len() + separator);
                if budget > 0 {
                    if separator == 1 {
                        text.push('\n');
                    }
                    text.push_str(truncate_on_char_boundary(trimmed, budget));
                }
                break;
            }
            if separator == 1 {
                text.push('\n');
            }
            text.push_str(trimmed);
        }

        if text.trim().is_empty() { None } else { Some(text) }
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

fn truncate_on_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_only_top_level_objects() {
        assert!(UntrustedDocument::from_json_str(r#"{"a": 1}"#).is_ok());
        assert!(UntrustedDocument::from_json_str(r#"[1, 2]"#).is_err());
        assert!(UntrustedDocument::from_json_str(r#""text""#).is_err());
        assert!(UntrustedDocument::from_json_str("not json at all").is_err());
    }

    #[test]
    fn str_field_reads_top_level_strings_only() {
        let doc = UntrustedDocument::from_value(json!({
            "model_version": "m-3",
            "count": 7,
            "nested": {"model_version": "hidden"}
        }))
        .unwrap();

        assert_eq!(doc.str_field("model_version"), Some("m-3"));
        assert_eq!(doc.str_field("count"), None);
        assert_eq!(doc.str_field("missing"), None);
    }

    #[test]
    fn searchable_text_joins_string_leaves() {
        let doc = UntrustedDocument::from_value(json!({
            "summary": "Senior engineer",
            "skills": ["rust", "redis"],
            "years": 11
        }))
        .unwrap();

        let text = doc.searchable_text().unwrap();
        assert!(text.contains("Senior engineer"));
        assert!(text.contains("rust"));
        assert!(text.contains("redis"));
        assert!(!text.contains("11"));
    }

    #[test]
    fn searchable_text_is_none_without_text() {
        let doc = UntrustedDocument::from_value(json!({
            "score": 0.93,
            "flags": [1, 2, 3],
            "blank": "   "
        }))
        .unwrap();

        assert!(doc.searchable_text().is_none());
    }

    #[test]
    fn searchable_text_is_capped() {
        let doc = UntrustedDocument::from_value(json!({
            "a": "x".repeat(MAX_SEARCHABLE_TEXT_LEN),
            "b": "more text on top"
        }))
        .unwrap();

        let text = doc.searchable_text().unwrap();
        assert!(text.len() <= MAX_SEARCHABLE_TEXT_LEN);
    }
}
