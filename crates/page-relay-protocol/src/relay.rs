//! Console relay: marker-framed request/response over the shared log.

use std::sync::Arc;

use page_relay_core::{
    Clock, Command, ConfigError, HostError, MARKER_PREFIX, Marker, RelayConfig, RelayResult,
    RemoteHost,
    script::{js_string, tag_of},
};
use thiserror::Error;
use tracing::{debug, warn};

const FRAME_TAG: &str = "frame";
const BODY_OPEN: &str = "    const __relayValue = await (async () => {\n";
const BODY_CLOSE: &str = "\n    })();\n";

/// Relay error.
///
/// Transient channel trouble never shows up here; it is folded into
/// `RelayResult::found_markers == false`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Script is empty")]
    EmptyScript,
    #[error("Script embeds the reserved marker prefix __PAGE_RELAY_")]
    ReservedToken,
    #[error("Command rejected by the executor: {0}")]
    Rejected(String),
    #[error("Invalid options: {0}")]
    InvalidOptions(#[from] ConfigError),
    #[error("Remote session lost: {0}")]
    SessionLost(#[source] HostError),
}

impl RelayError {
    /// Map a host error that cannot be absorbed.
    ///
    /// Returns `None` for transient errors, which callers treat as a miss.
    #[must_use]
    pub fn from_host(err: HostError) -> Option<Self> {
        match err {
            HostError::Transport(_) => None,
            HostError::Rejected(reason) => Some(Self::Rejected(reason)),
            HostError::Disconnected(_) => Some(Self::SessionLost(err)),
        }
    }
}

/// Wrap `script` so that its result is logged between the marker's sentinels.
///
/// `script` is the body of an async function: use `return` to produce a value.
/// A thrown exception is logged as `{"error": message}` inside the same frame.
/// Sentinels are assembled at run time so that an executor echoing the script
/// text back into the log cannot produce a false frame.
#[must_use]
pub fn frame_script(marker: &Marker, script: &str) -> String {
    format!(
        "/* page-relay:{FRAME_TAG} {token} */\n\
         (async () => {{\n  \
           const __relayToken = {token_literal};\n  \
           let __relayOut;\n  \
           try {{\n\
         {BODY_OPEN}{script}{BODY_CLOSE}    \
             __relayOut = JSON.stringify(__relayValue === undefined ? null : __relayValue);\n  \
           }} catch (__relayErr) {{\n    \
             __relayOut = JSON.stringify({{ error: String(__relayErr && __relayErr.message ? __relayErr.message : __relayErr) }});\n  \
           }}\n  \
           console.log(__relayToken + \"_START\");\n  \
           console.log(__relayOut);\n  \
           console.log(__relayToken + \"_END\");\n\
         }})();\n",
        token = marker.token(),
        token_literal = js_string(marker.token()),
    )
}

/// A script produced by [`frame_script`], taken apart again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramedScript<'a> {
    pub token: &'a str,
    pub body: &'a str,
}

impl<'a> FramedScript<'a> {
    /// Recognise a framed script.
    #[must_use]
    pub fn parse(script: &'a str) -> Option<Self> {
        let token = tag_of(script)?.strip_prefix(FRAME_TAG)?.trim();
        let from = script.find(BODY_OPEN)? + BODY_OPEN.len();
        let to = script.rfind(BODY_CLOSE)?;
        if token.is_empty() || to < from {
            return None;
        }
        Some(Self {
            token,
            body: &script[from..to],
        })
    }

    /// Marker the frame will be logged under.
    #[must_use]
    pub fn marker(&self) -> Marker {
        Marker::from_token(self.token)
    }
}

/// Issues framed scripts and correlates their output in the drained log.
///
/// Exactly one command is outstanding at a time: every exchange runs
/// issue, settle, drain in that order before returning.
#[derive(Clone)]
pub struct ConsoleRelay {
    host: Arc<dyn RemoteHost>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl ConsoleRelay {
    /// Create a relay over `host`.
    #[must_use]
    pub fn new(host: Arc<dyn RemoteHost>, clock: Arc<dyn Clock>, config: RelayConfig) -> Self {
        Self {
            host,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn host(&self) -> &Arc<dyn RemoteHost> {
        &self.host
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run one exchange for a caller-supplied script.
    ///
    /// # Errors
    /// Returns error for malformed scripts, rejected commands, or a lost
    /// session. Missing markers are reported through the result instead.
    pub async fn evaluate(&self, script: &str) -> Result<RelayResult, RelayError> {
        validate_script(script)?;
        self.exchange("eval", script).await
    }

    /// Evaluate a single expression.
    ///
    /// # Errors
    /// See [`ConsoleRelay::evaluate`].
    pub async fn evaluate_expression(&self, expression: &str) -> Result<RelayResult, RelayError> {
        if expression.trim().is_empty() {
            return Err(RelayError::EmptyScript);
        }
        self.evaluate(&format!("return ({expression});")).await
    }

    /// Run one exchange without caller-script validation.
    ///
    /// Used for scripts composed inside this crate.
    pub(crate) async fn exchange(
        &self,
        purpose: &str,
        script: &str,
    ) -> Result<RelayResult, RelayError> {
        let marker = Marker::new(purpose);
        debug!(token = marker.token(), purpose, "Issuing relay exchange");

        if let Err(err) = self
            .host
            .issue(Command::run_script(frame_script(&marker, script)))
            .await
        {
            if let Some(fatal) = RelayError::from_host(err.clone()) {
                return Err(fatal);
            }
            warn!(token = marker.token(), "Relay script not delivered: {err}");
            return Ok(RelayResult::missed(String::new()));
        }

        let mut last_text = String::new();
        for probe in 1..=self.config.drain_probes {
            self.clock.sleep(self.config.settle_delay()).await;

            let text = match self.host.drain_log().await {
                Ok(text) => text,
                Err(err) => {
                    if let Some(fatal) = RelayError::from_host(err.clone()) {
                        return Err(fatal);
                    }
                    warn!(token = marker.token(), probe, "Log drain failed: {err}");
                    continue;
                }
            };

            if text.is_empty() {
                debug!(token = marker.token(), probe, "Log empty, draining again");
                continue;
            }

            if let Some(frame) = marker.extract(&text) {
                debug!(
                    token = marker.token(),
                    probe,
                    frame_bytes = frame.len(),
                    "Relay frame located"
                );
                return Ok(RelayResult::framed(frame));
            }

            debug!(
                token = marker.token(),
                probe,
                log_bytes = text.len(),
                "Markers not in log yet"
            );
            last_text = text;
        }

        Ok(RelayResult::missed(last_text))
    }

    /// Issue a command whose failure should not abort the caller.
    ///
    /// Transient failures are logged and swallowed.
    ///
    /// # Errors
    /// Returns error only if the session is lost or the command is rejected.
    pub async fn issue_best_effort(&self, command: Command) -> Result<(), RelayError> {
        let kind = command.kind();
        match self.host.issue(command).await {
            Ok(()) => Ok(()),
            Err(err) => match RelayError::from_host(err.clone()) {
                Some(fatal) => Err(fatal),
                None => {
                    debug!(kind, "Best-effort command failed: {err}");
                    Ok(())
                }
            },
        }
    }
}

fn validate_script(script: &str) -> Result<(), RelayError> {
    if script.trim().is_empty() {
        return Err(RelayError::EmptyScript);
    }
    if script.contains(MARKER_PREFIX) {
        return Err(RelayError::ReservedToken);
    }
    Ok(())
}
