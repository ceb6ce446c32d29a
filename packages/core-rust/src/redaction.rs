//! Redaction and size-capped capture of request/response bodies for logging.
//!
//! Redaction is exact-key and top-level only: a sensitive field nested inside
//! another object is logged as-is. Bodies that are not valid JSON are logged
//! as an opaque, length-capped string with no field-level redaction.

use std::collections::BTreeSet;

use serde_json::Value;

/// Marker substituted for the value of a sensitive field.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Suffix appended to any representation cut at the capture limit.
pub const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Default hard cap, in bytes, on captured and logged body content.
pub const DEFAULT_CAPTURE_LIMIT: usize = 1024;

const DEFAULT_SENSITIVE_FIELDS: [&str; 5] = ["password", "token", "secret", "api_key", "apikey"];

/// Fixed set of top-level JSON field names whose values are never logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactionPolicy {
    fields: BTreeSet<String>,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_FIELDS)
    }
}

impl RedactionPolicy {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_sensitive(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// Replaces the value of every sensitive top-level key with the marker.
    /// Non-object values are returned unchanged.
    #[must_use]
    pub fn redact(&self, value: Value) -> Value {
        match value {
            Value::Object(mut map) => {
                for (key, field) in &mut map {
                    if self.is_sensitive(key) {
                        *field = Value::String(REDACTION_MARKER.to_string());
                    }
                }
                Value::Object(map)
            }
            other => other,
        }
    }

    /// Produces the loggable representation of a complete body.
    ///
    /// JSON bodies are re-serialized (compactly) after redaction; anything
    /// else is rendered lossily as UTF-8. Either way the result is cut to
    /// `limit` bytes with [`TRUNCATION_SUFFIX`] appended.
    #[must_use]
    pub fn render(&self, body: &[u8], limit: usize) -> String {
        if body.is_empty() {
            return String::new();
        }
        let text = match serde_json::from_slice::<Value>(body) {
            Ok(value) => self.redact(value).to_string(),
            Err(_) => String::from_utf8_lossy(body).into_owned(),
        };
        truncate(&text, limit)
    }
}

/// Cuts `text` to at most `limit` bytes on a char boundary, marking the cut.
#[must_use]
pub fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_SUFFIX}", &text[..end])
}

// ---------------------------------------------------------------------------
// CapturedBody
// ---------------------------------------------------------------------------

/// Size-capped mirror of a streamed body, used purely for logging.
///
/// Pushing never fails and never blocks; bytes past the cap are counted but
/// not retained.
#[derive(Debug, Clone)]
pub struct CapturedBody {
    bytes: Vec<u8>,
    limit: usize,
    total: usize,
}

impl Default for CapturedBody {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_LIMIT)
    }
}

impl CapturedBody {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total = self.total.saturating_add(chunk.len());
        let room = self.limit.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
    }

    /// Total number of bytes observed, including those past the cap.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.total > self.bytes.len()
    }

    /// Loggable representation of the capture.
    ///
    /// A truncated capture cannot be parsed. If it opens a JSON object its
    /// content is withheld, since sensitive keys could not be redacted;
    /// anything else is logged opaquely.
    #[must_use]
    pub fn render(&self, policy: &RedactionPolicy) -> String {
        if !self.is_truncated() {
            return policy.render(&self.bytes, self.limit);
        }
        if looks_like_json_object(&self.bytes) {
            return format!("{{{WITHHELD_MARKER} {} bytes}}", self.total);
        }
        let text = String::from_utf8_lossy(&self.bytes);
        let cut = truncate(&text, self.limit);
        if cut.ends_with(TRUNCATION_SUFFIX) {
            cut
        } else {
            format!("{cut}{TRUNCATION_SUFFIX}")
        }
    }
}

/// Placed in the rendering of a truncated JSON object instead of its content.
pub const WITHHELD_MARKER: &str = "[WITHHELD: truncated JSON object]";

fn looks_like_json_object(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_policy_covers_known_fields() {
        let policy = RedactionPolicy::default();
        for field in ["password", "token", "secret", "api_key", "apikey"] {
            assert!(policy.is_sensitive(field), "{field} should be sensitive");
        }
        assert!(!policy.is_sensitive("username"));
        assert!(!policy.is_sensitive("Password"));
    }

    #[test]
    fn password_is_redacted_and_username_kept() {
        let policy = RedactionPolicy::default();
        let rendered = policy.render(br#"{"username":"u","password":"p"}"#, DEFAULT_CAPTURE_LIMIT);
        let value: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["username"], "u");
        assert_eq!(value["password"], REDACTION_MARKER);
    }

    #[test]
    fn nested_fields_are_not_redacted() {
        let policy = RedactionPolicy::default();
        let rendered = policy.render(br#"{"auth":{"token":"t"}}"#, DEFAULT_CAPTURE_LIMIT);
        assert!(rendered.contains(r#""token":"t""#));
    }

    #[test]
    fn non_json_is_logged_opaquely_and_truncated() {
        let policy = RedactionPolicy::default();
        let body = "password=hunter2&".repeat(200);
        let rendered = policy.render(body.as_bytes(), 64);
        assert!(rendered.starts_with("password=hunter2"));
        assert!(rendered.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(rendered.len(), 64 + TRUNCATION_SUFFIX.len());
    }

    #[test]
    fn json_arrays_pass_through_unredacted() {
        let policy = RedactionPolicy::default();
        let rendered = policy.render(br#"[{"password":"p"}]"#, DEFAULT_CAPTURE_LIMIT);
        assert_eq!(rendered, r#"[{"password":"p"}]"#);
    }

    #[test]
    fn empty_body_renders_empty() {
        assert_eq!(RedactionPolicy::default().render(b"", 10), "");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let cut = truncate("héllo", 2);
        assert_eq!(cut, format!("h{TRUNCATION_SUFFIX}"));
    }

    #[test]
    fn captured_body_counts_past_the_cap() {
        let mut captured = CapturedBody::new(4);
        captured.push(b"ab");
        captured.push(b"cdef");
        assert_eq!(captured.bytes, b"abcd");
        assert_eq!(captured.total_len(), 6);
        assert!(captured.is_truncated());
        assert_eq!(
            captured.render(&RedactionPolicy::default()),
            format!("abcd{TRUNCATION_SUFFIX}")
        );
    }

    #[test]
    fn complete_capture_is_redacted() {
        let mut captured = CapturedBody::default();
        captured.push(br#"{"token":"abc","id":1}"#);
        let rendered = captured.render(&RedactionPolicy::default());
        assert!(rendered.contains(REDACTION_MARKER));
        assert!(!rendered.contains("abc"));
    }

    #[test]
    fn truncated_json_object_is_withheld() {
        let mut captured = CapturedBody::new(32);
        let body = format!(r#"  {{"token":"s3cr3t","items":"{}"}}"#, "x".repeat(100));
        captured.push(body.as_bytes());

        let rendered = captured.render(&RedactionPolicy::default());
        assert!(rendered.contains(WITHHELD_MARKER));
        assert!(rendered.contains(&body.len().to_string()));
        assert!(!rendered.contains("s3cr3t"));
    }

    proptest! {
        #[test]
        fn render_is_bounded(body in proptest::collection::vec(any::<u8>(), 0..4096), limit in 1usize..2048) {
            let rendered = RedactionPolicy::default().render(&body, limit);
            prop_assert!(rendered.len() <= limit + TRUNCATION_SUFFIX.len());
        }

        #[test]
        fn capture_never_retains_more_than_limit(chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 0..16)) {
            let mut captured = CapturedBody::new(256);
            let mut total = 0;
            for chunk in &chunks {
                captured.push(chunk);
                total += chunk.len();
            }
            prop_assert!(captured.bytes.len() <= 256);
            prop_assert_eq!(captured.total_len(), total);
        }
    }
}
