//! Console records with bounded history.

use std::{
    collections::VecDeque,
    fmt,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

/// Default history size limit (4 MB of log text).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

/// Console severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Debug,
    Warn,
    Error,
}

impl ConsoleLevel {
    /// Every level the capture wraps.
    pub const ALL: [Self; 5] = [Self::Log, Self::Info, Self::Debug, Self::Warn, Self::Error];

    /// Name of the matching `console` method.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// One captured console call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleRecord {
    /// ISO-8601 timestamp assigned by the page.
    pub timestamp: String,
    pub level: ConsoleLevel,
    /// Arguments, stringified and joined with spaces.
    pub text: String,
}

impl ConsoleRecord {
    /// Create a record.
    #[must_use]
    pub fn new(timestamp: impl Into<String>, level: ConsoleLevel, text: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            level,
            text: text.into(),
        }
    }

    fn approx_bytes(&self) -> usize {
        self.timestamp.len() + self.text.len() + 16
    }
}

#[derive(Clone)]
struct StoredRecord {
    record: ConsoleRecord,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredRecord>,
    total_bytes: usize,
}

/// Record store keeping the most recent records within a byte budget.
pub struct ConsoleStore {
    inner: RwLock<Inner>,
}

impl Default for ConsoleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(64),
                total_bytes: 0,
            }),
        }
    }

    /// Append a record, evicting the oldest ones past the byte budget.
    pub fn push(&self, record: ConsoleRecord) {
        let bytes = record.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredRecord { record, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Drop all retained history.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.history.clear();
        inner.total_bytes = 0;
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the retained records.
    #[must_use]
    pub fn history(&self) -> Vec<ConsoleRecord> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.record.clone())
            .collect()
    }

    /// Retained record texts joined with newlines, oldest first.
    #[must_use]
    pub fn render(&self) -> String {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::with_capacity(inner.total_bytes);
        for (i, stored) in inner.history.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&stored.record.text);
        }
        out
    }
}
