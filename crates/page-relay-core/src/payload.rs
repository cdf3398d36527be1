//! Typed results of a relay exchange.

use serde_json::Value;

/// What a framed exchange carried back.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The frame held valid JSON.
    Parsed(Value),
    /// The frame held text that is not JSON.
    Raw(String),
    /// The remote script threw; the message is surfaced as data.
    Error(String),
    /// No frame was found.
    Absent,
}

impl Payload {
    /// Classify the text found between a marker pair.
    ///
    /// A JSON object whose sole key is a string `error` is a remote exception.
    #[must_use]
    pub fn from_frame(frame: &str) -> Self {
        let trimmed = frame.trim();
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => {
                if map.len() == 1 {
                    if let Some(Value::String(message)) = map.get("error") {
                        return Self::Error(message.clone());
                    }
                }
                Self::Parsed(Value::Object(map))
            }
            Ok(value) => Self::Parsed(value),
            Err(_) => Self::Raw(trimmed.to_string()),
        }
    }

    /// Parsed JSON value, if any.
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Parsed(value) => Some(value),
            _ => None,
        }
    }

    /// Whether no frame was found.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Normalise into a list of records: arrays are flattened one level,
    /// any other JSON value becomes a one-element list.
    #[must_use]
    pub fn into_records(self) -> Vec<Value> {
        match self {
            Self::Parsed(Value::Array(items)) => items,
            Self::Parsed(Value::Null) | Self::Raw(_) | Self::Error(_) | Self::Absent => Vec::new(),
            Self::Parsed(value) => vec![value],
        }
    }
}

/// Outcome of one relay call.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayResult {
    /// The trimmed frame text when markers were found, otherwise the last
    /// drained log text (kept for diagnostics).
    pub raw_text: String,
    /// Decoded payload.
    pub payload: Payload,
    /// Whether both markers were located.
    pub found_markers: bool,
    /// Number of exchanges it took to produce this result.
    pub attempts: u32,
}

impl RelayResult {
    /// Result for a frame found in the log.
    #[must_use]
    pub fn framed(frame: &str) -> Self {
        Self {
            raw_text: frame.trim().to_string(),
            payload: Payload::from_frame(frame),
            found_markers: true,
            attempts: 1,
        }
    }

    /// Result for an exchange whose markers never showed up.
    #[must_use]
    pub const fn missed(raw_text: String) -> Self {
        Self {
            raw_text,
            payload: Payload::Absent,
            found_markers: false,
            attempts: 1,
        }
    }

    /// Set the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Markers found and the remote script did not throw.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.found_markers && !matches!(self.payload, Payload::Error(_) | Payload::Absent)
    }
}

/// Find standalone JSON objects and arrays embedded in unframed log text.
///
/// Scanning resumes after each value found, so nested structures are
/// returned once, as their outermost value.
#[must_use]
pub fn scan_json_fragments(text: &str) -> Vec<Value> {
    let mut found = Vec::new();
    let mut resume = 0;
    for (idx, ch) in text.char_indices() {
        if idx < resume || !matches!(ch, '{' | '[') {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            resume = idx + stream.byte_offset();
            found.push(value);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_literal_payloads_parse_exactly() {
        assert_eq!(Payload::from_frame(" 42 "), Payload::Parsed(json!(42)));
        assert_eq!(Payload::from_frame("\"hello\""), Payload::Parsed(json!("hello")));
        assert_eq!(Payload::from_frame("{\"a\":1}"), Payload::Parsed(json!({"a": 1})));
        assert_eq!(Payload::from_frame("[1,2,3]"), Payload::Parsed(json!([1, 2, 3])));
    }

    #[test]
    fn test_unparsable_frame_degrades_to_raw() {
        assert_eq!(
            Payload::from_frame("\n  Retrieved 3 console messages  \n"),
            Payload::Raw("Retrieved 3 console messages".to_string())
        );
    }

    #[test]
    fn test_error_object_is_exception() {
        assert_eq!(
            Payload::from_frame("{\"error\":\"foo is not defined\"}"),
            Payload::Error("foo is not defined".to_string())
        );
        // Extra keys mean an ordinary value that happens to mention an error.
        assert_eq!(
            Payload::from_frame("{\"error\":\"x\",\"count\":2}"),
            Payload::Parsed(json!({"error": "x", "count": 2}))
        );
        assert_eq!(
            Payload::from_frame("{\"error\":null}"),
            Payload::Parsed(json!({"error": null}))
        );
    }

    #[test]
    fn test_success_requires_markers_and_no_exception() {
        assert!(RelayResult::framed("1").is_success());
        assert!(!RelayResult::framed("{\"error\":\"boom\"}").is_success());
        assert!(!RelayResult::missed("noise".into()).is_success());
    }

    #[test]
    fn test_into_records() {
        assert_eq!(
            Payload::Parsed(json!([{"a": 1}, {"a": 2}])).into_records().len(),
            2
        );
        assert_eq!(Payload::Parsed(json!({"a": 1})).into_records(), vec![json!({"a": 1})]);
        assert!(Payload::Raw("x".into()).into_records().is_empty());
        assert!(Payload::Absent.into_records().is_empty());
    }

    #[test]
    fn test_scan_json_fragments() {
        let log = "Retrieved 2 messages\n{\"name\":\"EECS\",\"tags\":[\"ai\"]} tail [1, 2] {broken";
        let found = scan_json_fragments(log);
        assert_eq!(
            found,
            vec![json!({"name": "EECS", "tags": ["ai"]}), json!([1, 2])]
        );
        assert!(scan_json_fragments("no json here").is_empty());
    }
}
