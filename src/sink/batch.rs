//! NDJSON payload to JSON batch conversion.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// How each parsed line is placed in the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchFormat {
    /// The parsed JSON value as-is.
    #[default]
    Raw,
    /// `{"text": "<compact JSON>"}`.
    Text,
}

/// Request body: `{"events": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JsonBatch {
    pub events: Vec<Value>,
}

/// A batch together with the number of lines that failed to parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedBatch {
    pub batch: JsonBatch,
    pub dropped: usize,
}

/// Parse an NDJSON payload into a batch.
///
/// Blank lines are ignored. Lines that are not valid JSON are logged and
/// dropped without affecting the others. Order is preserved.
pub fn format_batch(payload: &[u8], format: BatchFormat, target: &str) -> FormattedBatch {
    let mut formatted = FormattedBatch::default();

    for (index, line) in payload.split(|&b| b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match serde_json::from_slice::<Value>(line) {
            Ok(value) => formatted.batch.events.push(match format {
                BatchFormat::Raw => value,
                BatchFormat::Text => serde_json::json!({ "text": value.to_string() }),
            }),
            Err(e) => {
                warn!(
                    target = %target,
                    line = index + 1,
                    error = %e,
                    "Dropping line that is not valid JSON"
                );
                formatted.dropped += 1;
            }
        }
    }

    formatted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bad_line_is_dropped_and_order_kept() {
        let result = format_batch(b"{\"a\":1}\ngarbage\n{\"b\":2}", BatchFormat::Raw, "test");

        assert_eq!(result.batch.events, vec![json!({"a": 1}), json!({"b": 2})]);
        assert_eq!(result.dropped, 1);
        assert_eq!(
            serde_json::to_string(&result.batch).unwrap(),
            r#"{"events":[{"a":1},{"b":2}]}"#
        );
    }

    #[test]
    fn test_blank_lines_and_crlf() {
        let result = format_batch(b"\r\n{\"a\":1}\r\n   \n\n{\"b\":2}\r\n", BatchFormat::Raw, "test");

        assert_eq!(result.batch.events, vec![json!({"a": 1}), json!({"b": 2})]);
        assert_eq!(result.dropped, 0);
    }

    #[test]
    fn test_empty_payload_yields_empty_batch() {
        let result = format_batch(b"", BatchFormat::Raw, "test");
        assert!(result.batch.events.is_empty());
        assert_eq!(serde_json::to_string(&result.batch).unwrap(), r#"{"events":[]}"#);
    }

    #[test]
    fn test_non_object_values_are_kept() {
        let result = format_batch(b"1\n\"s\"\n[true]\nnull", BatchFormat::Raw, "test");
        assert_eq!(
            result.batch.events,
            vec![json!(1), json!("s"), json!([true]), Value::Null]
        );
    }

    #[test]
    fn test_text_format_wraps_compact_json() {
        let result = format_batch(b"{ \"a\" : 1 }\n", BatchFormat::Text, "test");
        assert_eq!(result.batch.events, vec![json!({"text": "{\"a\":1}"})]);
    }

    #[test]
    fn test_invalid_utf8_line_is_dropped() {
        let result = format_batch(b"{\"a\":1}\n\xff\xfe\n", BatchFormat::Raw, "test");
        assert_eq!(result.batch.events.len(), 1);
        assert_eq!(result.dropped, 1);
    }
}
