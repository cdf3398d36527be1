//! Helpers for composing page scripts.
//!
//! Scripts built by this workspace open with a tag comment naming the
//! operation, e.g. `/* page-relay:capture-probe */`. The tag has no effect in
//! the page; it lets hosts and transcripts tell operations apart.

const TAG_OPEN: &str = "/* page-relay:";
const TAG_CLOSE: &str = " */";

/// Prefix `body` with a tag comment.
#[must_use]
pub fn tagged(tag: &str, body: &str) -> String {
    format!("{TAG_OPEN}{tag}{TAG_CLOSE}\n{body}")
}

/// Tag of a script built with [`tagged`], if any.
#[must_use]
pub fn tag_of(script: &str) -> Option<&str> {
    let rest = script.trim_start().strip_prefix(TAG_OPEN)?;
    let (tag, _) = rest.split_once(TAG_CLOSE)?;
    Some(tag.trim())
}

/// Quote `value` as a JavaScript string literal.
#[must_use]
pub fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
