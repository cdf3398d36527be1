//! Executor wire dialect.
//!
//! Commands go out as single tag blocks the executor understands; replies
//! come back as one JSON object per line.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use page_relay_core::{Command, HostError};
use serde::{Deserialize, Serialize};

const SCRIPT_OPEN: &str = "<run_javascript_browser>";
const SCRIPT_CLOSE: &str = "</run_javascript_browser>";

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid screenshot data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Click selector must be box=<id> or devinid=<id>, got {0:?}")]
    UnsupportedSelector(String),
    #[error("Script contains the closing </run_javascript_browser> tag")]
    UnframeableScript,
}

/// Render a command as executor tag text.
///
/// # Errors
/// Returns error if the command cannot be expressed in the dialect.
pub fn render_command(command: &Command) -> Result<String, ProtocolError> {
    Ok(match command {
        Command::Navigate { url } => format!("<navigate_browser url=\"{}\"/>", escape_attr(url)),
        Command::RunScript { script } => {
            if script.contains(SCRIPT_CLOSE) {
                return Err(ProtocolError::UnframeableScript);
            }
            format!("{SCRIPT_OPEN}\n{script}\n{SCRIPT_CLOSE}")
        }
        Command::Wait { seconds } => format!("<wait for=\"browser\" seconds=\"{seconds}\"/>"),
        Command::Click { selector } => {
            format!("<click_browser box=\"{}\"/>", escape_attr(click_target(selector)?))
        }
        Command::Screenshot { note } => {
            format!("<screenshot_browser>\n{note}\n</screenshot_browser>")
        }
        Command::DrainLog => "<get_browser_console/>".to_string(),
    })
}

/// Element id addressed by a `box=<id>` or `devinid=<id>` selector.
///
/// # Errors
/// Returns error for any other selector form.
pub fn click_target(selector: &str) -> Result<&str, ProtocolError> {
    let selector = selector.trim();
    selector
        .strip_prefix("box=")
        .or_else(|| selector.strip_prefix("devinid="))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProtocolError::UnsupportedSelector(selector.to_string()))
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Reply from the executor to one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostReply {
    /// Current console log text.
    Console { text: String },
    /// Command accepted.
    Ack,
    /// Screenshot image (base64 encoded).
    Screenshot { data: String },
    /// Command refused; retrying the same command will not help.
    Rejected { reason: String },
    /// Command failed. `fatal` means the browser session is gone.
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

impl HostReply {
    /// Create a screenshot reply from raw image bytes.
    #[must_use]
    pub fn screenshot(data: &[u8]) -> Self {
        Self::Screenshot {
            data: BASE64.encode(data),
        }
    }

    /// Decode screenshot data from base64.
    ///
    /// # Errors
    /// Returns error if the data is not valid base64.
    pub fn decode_screenshot(&self) -> Result<Option<Bytes>, ProtocolError> {
        match self {
            Self::Screenshot { data } => Ok(Some(Bytes::from(BASE64.decode(data)?))),
            _ => Ok(None),
        }
    }

    /// Parse one reply line.
    ///
    /// # Errors
    /// Returns error if the line is not a reply object.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Host error carried by this reply, if any.
    #[must_use]
    pub fn host_error(&self) -> Option<HostError> {
        match self {
            Self::Rejected { reason } => Some(HostError::Rejected(reason.clone())),
            Self::Error {
                message,
                fatal: true,
            } => Some(HostError::Disconnected(message.clone())),
            Self::Error { message, .. } => Some(HostError::Transport(message.clone())),
            Self::Console { .. } | Self::Ack | Self::Screenshot { .. } => None,
        }
    }
}
