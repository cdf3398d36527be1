//! Sentinel markers framing a single exchange inside the shared log.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use uuid::Uuid;

/// Prefix of every marker token. Scripts supplied by callers may not contain it.
pub const MARKER_PREFIX: &str = "__PAGE_RELAY_";

const START_SUFFIX: &str = "_START";
const END_SUFFIX: &str = "_END";
const MAX_PURPOSE_LEN: usize = 24;

/// Process-wide sequence folded into every token.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A start/end sentinel pair unique to one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Marker {
    token: String,
    start: String,
    end: String,
}

impl Marker {
    /// Generate a fresh marker for `purpose`.
    ///
    /// Tokens combine wall-clock milliseconds, random bits and an in-process
    /// counter, so two calls never collide even within the same millisecond.
    #[must_use]
    pub fn new(purpose: &str) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let random = Uuid::new_v4().simple().to_string();
        Self::from_token(format!(
            "{MARKER_PREFIX}{}_{millis}_{}{sequence:06x}",
            sanitize_purpose(purpose),
            &random[..12],
        ))
    }

    /// Rebuild a marker from a token seen in a framed script.
    #[must_use]
    pub fn from_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            start: format!("{token}{START_SUFFIX}"),
            end: format!("{token}{END_SUFFIX}"),
            token,
        }
    }

    /// Shared token without suffix.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Start sentinel.
    #[must_use]
    pub fn start(&self) -> &str {
        &self.start
    }

    /// End sentinel.
    #[must_use]
    pub fn end(&self) -> &str {
        &self.end
    }

    /// Slice of `text` strictly between the start sentinel and the first end
    /// sentinel following it.
    #[must_use]
    pub fn extract<'a>(&self, text: &'a str) -> Option<&'a str> {
        let from = text.find(&self.start)? + self.start.len();
        let len = text[from..].find(&self.end)?;
        Some(&text[from..from + len])
    }
}

/// Generate a marker pair for `purpose`.
#[must_use]
pub fn new_marker(purpose: &str) -> Marker {
    Marker::new(purpose)
}

fn sanitize_purpose(purpose: &str) -> String {
    let cleaned: String = purpose
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .take(MAX_PURPOSE_LEN)
        .collect();
    if cleaned.is_empty() {
        "EXCHANGE".to_string()
    } else {
        cleaned
    }
}
