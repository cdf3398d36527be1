//! Commands understood by the remote executor.

use serde::{Deserialize, Serialize};

/// An instruction for the remote page host.
///
/// Commands are constructed per call and discarded once delivered; nothing
/// in this workspace persists them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Load a URL in the remote page.
    Navigate { url: String },
    /// Run a script in the page context.
    RunScript { script: String },
    /// Ask the executor itself to pause.
    Wait { seconds: u64 },
    /// Click an element identified by an executor-specific selector.
    Click { selector: String },
    /// Capture a screenshot, annotated with a note for whoever reads it.
    Screenshot { note: String },
    /// Dump the current log buffer.
    DrainLog,
}

impl Command {
    /// Create a navigation command.
    #[must_use]
    pub fn navigate<S: Into<String>>(url: S) -> Self {
        Self::Navigate { url: url.into() }
    }

    /// Create a script command.
    #[must_use]
    pub fn run_script<S: Into<String>>(script: S) -> Self {
        Self::RunScript {
            script: script.into(),
        }
    }

    /// Create a screenshot command.
    #[must_use]
    pub fn screenshot<S: Into<String>>(note: S) -> Self {
        Self::Screenshot { note: note.into() }
    }

    /// Create a click command.
    #[must_use]
    pub fn click<S: Into<String>>(selector: S) -> Self {
        Self::Click {
            selector: selector.into(),
        }
    }

    /// Short name of the command kind, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::RunScript { .. } => "run_script",
            Self::Wait { .. } => "wait",
            Self::Click { .. } => "click",
            Self::Screenshot { .. } => "screenshot",
            Self::DrainLog => "drain_log",
        }
    }
}
