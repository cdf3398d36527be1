//! Idempotent console capture.
//!
//! The installer wraps every `console` method in the page so each call is
//! also appended to `window.__pageRelayCapture.buffer`. Wrappers are tagged
//! with [`CAPTURE_SIGNATURE`] and keep a reference to the method they
//! replaced, so a later pass can recognise its own work and unwind it.
//!
//! Remote bookkeeping lives in one object:
//!
//! ```text
//! window.__pageRelayCapture = { initialized, signature, buffer, originals }
//! ```

use std::collections::BTreeMap;

use page_relay_core::{
    Command, ConsoleLevel, ConsoleRecord, MARKER_PREFIX, Payload, RelayResult,
    script::{js_string, tagged},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    relay::{ConsoleRelay, RelayError},
    retry::{RetryPolicy, Step, diagnostic_screenshot},
};

/// Tag carried by wrappers installed by this module.
pub const CAPTURE_SIGNATURE: &str = "page-relay-capture/1";

/// Records kept in the remote buffer before the oldest are dropped.
pub const CAPTURE_LIMIT: usize = 1_000;

const VERIFY_PREFIX: &str = "PAGE_RELAY_VERIFY_";

const PROBE_JS: &str = r#"const capture = window.__pageRelayCapture;
const wrapped = {};
for (const level of %LEVELS%) {
  const method = console[level];
  wrapped[level] = {
    wrapped: !!(method && method.__pageRelaySignature === %SIGNATURE%),
    hasOriginal: !!(method && typeof method.__pageRelayOriginal === "function"),
  };
}
return {
  initialized: !!(capture && capture.initialized),
  hasBuffer: !!(capture && Array.isArray(capture.buffer)),
  hasOriginalMethods: !!(capture && capture.originals && Object.keys(capture.originals).length > 0),
  signature: capture && typeof capture.signature === "string" ? capture.signature : null,
  wrapped,
};"#;

const TEARDOWN_JS: &str = r#"const capture = window.__pageRelayCapture;
let restored = 0;
for (const level of %LEVELS%) {
  let method = console[level];
  let depth = 0;
  while (method && typeof method.__pageRelayOriginal === "function" && depth < 32) {
    method = method.__pageRelayOriginal;
    depth += 1;
  }
  if (depth === 0 && capture && capture.originals && typeof capture.originals[level] === "function") {
    method = capture.originals[level];
  }
  if (method && method !== console[level]) {
    console[level] = method;
    restored += 1;
  }
}
delete window.__pageRelayCapture;
return { restored };"#;

const INSTALL_JS: &str = r#"if (window.__pageRelayCapture) {
  throw new Error("capture bookkeeping already present");
}
const capture = { initialized: false, signature: %SIGNATURE%, buffer: [], originals: {} };
window.__pageRelayCapture = capture;
try {
  for (const level of %LEVELS%) {
    const original = console[level];
    if (typeof original !== "function") {
      throw new Error("console." + level + " is not a function");
    }
    capture.originals[level] = original;
    const wrapper = function (...args) {
      const text = args.map((arg) => {
        if (typeof arg === "object" && arg !== null) {
          try {
            return JSON.stringify(arg);
          } catch (e) {
            return "[unserializable]";
          }
        }
        return String(arg);
      }).join(" ");
      capture.buffer.push({ timestamp: new Date().toISOString(), level, text });
      if (capture.buffer.length > %LIMIT%) {
        capture.buffer.splice(0, capture.buffer.length - %LIMIT%);
      }
      return original.apply(console, args);
    };
    wrapper.__pageRelaySignature = %SIGNATURE%;
    wrapper.__pageRelayOriginal = original;
    console[level] = wrapper;
  }
  capture.initialized = true;
  return { installed: true };
} catch (err) {
  for (const level of Object.keys(capture.originals)) {
    console[level] = capture.originals[level];
  }
  delete window.__pageRelayCapture;
  throw err;
}"#;

const VERIFY_JS: &str = r"const token = %TOKEN%;
console.log(token);
const capture = window.__pageRelayCapture;
return {
  captured: !!(capture && Array.isArray(capture.buffer) && capture.buffer.some((r) => r.text === token)),
};";

const READ_JS: &str = r"const capture = window.__pageRelayCapture;
return capture && Array.isArray(capture.buffer) ? capture.buffer : [];";

const CLEAR_JS: &str = r"if (window.__pageRelayCapture && Array.isArray(window.__pageRelayCapture.buffer)) {
  window.__pageRelayCapture.buffer.length = 0;
}";

fn levels_literal() -> String {
    let names: Vec<&str> = ConsoleLevel::ALL.iter().map(|l| l.method()).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}

fn render(template: &str) -> String {
    template
        .replace("%LEVELS%", &levels_literal())
        .replace("%SIGNATURE%", &js_string(CAPTURE_SIGNATURE))
        .replace("%LIMIT%", &CAPTURE_LIMIT.to_string())
}

/// Script reporting the remote [`InstallationState`].
#[must_use]
pub fn probe_script() -> String {
    tagged("capture-probe", &render(PROBE_JS))
}

/// Script restoring every console method and deleting the bookkeeping.
#[must_use]
pub fn teardown_script() -> String {
    tagged("capture-teardown", &render(TEARDOWN_JS))
}

/// Script wrapping every console method.
///
/// Throws if bookkeeping already exists; restores on any failure.
#[must_use]
pub fn install_script() -> String {
    tagged("capture-install", &render(INSTALL_JS))
}

/// Script logging `token` and reporting whether the buffer saw it.
#[must_use]
pub fn verify_script(token: &str) -> String {
    tagged(
        "capture-verify",
        &VERIFY_JS.replace("%TOKEN%", &js_string(token)),
    )
}

/// Token embedded in a script built by [`verify_script`].
#[must_use]
pub fn verify_token(script: &str) -> Option<String> {
    let start = script.find("const token = ")? + "const token = ".len();
    let end = start + script[start..].find(";\n")?;
    serde_json::from_str(&script[start..end]).ok()
}

/// Script returning the captured records.
#[must_use]
pub fn read_script() -> String {
    tagged("capture-read", READ_JS)
}

/// Unframed statement emptying the capture buffer.
#[must_use]
pub fn clear_script() -> String {
    tagged("capture-clear", CLEAR_JS)
}

/// Per-method wrapper state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapState {
    /// Current method carries this installer's signature.
    pub wrapped: bool,
    /// Current method keeps a reference to the one it replaced.
    pub has_original: bool,
}

/// Capture bookkeeping as reported by the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallationState {
    pub initialized: bool,
    pub has_buffer: bool,
    pub has_original_methods: bool,
    pub signature: Option<String>,
    pub wrapped: BTreeMap<String, WrapState>,
}

/// Classification of an [`InstallationState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    NotInstalled,
    Installed,
    /// Something is present but not a complete, current installation.
    Stale { reasons: Vec<String> },
}

impl InstallationState {
    /// Classify the reported state.
    #[must_use]
    pub fn status(&self) -> InstallStatus {
        let any_wrapper = self.wrapped.values().any(|w| w.wrapped || w.has_original);
        let any_bookkeeping = self.initialized || self.has_buffer || self.has_original_methods;
        if !any_wrapper && !any_bookkeeping {
            return InstallStatus::NotInstalled;
        }

        let mut reasons = Vec::new();
        if !self.initialized {
            reasons.push("flag not set".to_string());
        }
        if !self.has_buffer {
            reasons.push("buffer missing".to_string());
        }
        if !self.has_original_methods {
            reasons.push("originals missing".to_string());
        }
        match self.signature.as_deref() {
            Some(CAPTURE_SIGNATURE) => {}
            Some(other) => reasons.push(format!("foreign signature {other}")),
            None if any_bookkeeping => reasons.push("signature missing".to_string()),
            None => {}
        }
        for level in ConsoleLevel::ALL {
            match self.wrapped.get(level.method()) {
                Some(WrapState {
                    wrapped: true,
                    has_original: true,
                }) => {}
                Some(WrapState { wrapped: true, .. }) => {
                    reasons.push(format!("console.{level} lost its original"));
                }
                _ => reasons.push(format!("console.{level} not wrapped")),
            }
        }

        if reasons.is_empty() {
            InstallStatus::Installed
        } else {
            InstallStatus::Stale { reasons }
        }
    }
}

/// Outcome of [`Installer::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Capture is installed and a verification token round-tripped.
    pub initialized: bool,
    /// Status reported by the first successful probe, if any.
    pub status_before: Option<InstallStatus>,
    /// A fresh install script ran.
    pub reinstalled: bool,
    /// A teardown ran and its completion was observed.
    pub tore_down: bool,
    pub attempts: u32,
}

/// Why one installer pass did not finish.
enum PassFailure {
    ProbeMissed,
    InstallFailed(String),
    NotVerified,
    TeardownUnconfirmed,
}

/// Runs probe, teardown, install and verify passes through a relay.
#[derive(Clone)]
pub struct Installer {
    relay: ConsoleRelay,
    policy: RetryPolicy,
}

impl Installer {
    #[must_use]
    pub fn new(relay: ConsoleRelay) -> Self {
        let policy = RetryPolicy::for_install(relay.config());
        Self { relay, policy }
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Read the remote installation state.
    ///
    /// Returns `None` when the probe produced no usable frame.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn probe(&self) -> Result<Option<InstallationState>, RelayError> {
        let result = self.relay.exchange("capture_probe", &probe_script()).await?;
        Ok(decode::<InstallationState>(&result))
    }

    /// Restore every console method and delete the bookkeeping.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn teardown(&self) -> Result<bool, RelayError> {
        let result = self
            .relay
            .exchange("capture_teardown", &teardown_script())
            .await?;
        Ok(result.is_success())
    }

    /// Tear down, warning when completion was never observed.
    async fn teardown_checked(&self, why: &str) -> Result<bool, RelayError> {
        let confirmed = self.teardown().await?;
        if !confirmed {
            warn!(why, "Capture teardown not confirmed");
        }
        Ok(confirmed)
    }

    /// Log a fresh token and check the buffer saw it.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn verify(&self) -> Result<bool, RelayError> {
        let token = format!("{VERIFY_PREFIX}{}", Uuid::new_v4().simple());
        let result = self
            .relay
            .exchange("capture_verify", &verify_script(&token))
            .await?;
        let captured = result
            .payload
            .as_value()
            .and_then(|v| v.get("captured"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        debug!(%token, captured, "Capture verification");
        Ok(captured)
    }

    /// Run the install script once, tearing down on any failure.
    async fn install_once(&self) -> Result<Result<(), PassFailure>, RelayError> {
        let result = self
            .relay
            .exchange("capture_install", &install_script())
            .await?;
        if result.is_success() {
            return Ok(Ok(()));
        }
        let reason = match &result.payload {
            Payload::Error(message) => message.clone(),
            _ => "install result not observed".to_string(),
        };
        warn!(%reason, "Capture install failed, tearing down");
        self.teardown_checked("failed install").await?;
        Ok(Err(PassFailure::InstallFailed(reason)))
    }

    /// One probe, teardown-if-needed, install, verify pass.
    async fn pass(&self, report: &mut InstallReport) -> Result<Result<(), PassFailure>, RelayError> {
        let Some(state) = self.probe().await? else {
            return Ok(Err(PassFailure::ProbeMissed));
        };
        let status = state.status();
        if report.status_before.is_none() {
            report.status_before = Some(status.clone());
        }

        match status {
            InstallStatus::Installed => {
                if self.verify().await? {
                    debug!("Capture already installed and verified");
                    return Ok(Ok(()));
                }
                warn!("Installed capture failed verification, reinstalling");
                if !self.teardown_checked("unverified capture").await? {
                    return Ok(Err(PassFailure::TeardownUnconfirmed));
                }
                report.tore_down = true;
            }
            InstallStatus::Stale { reasons } => {
                warn!(?reasons, "Stale capture detected, tearing down");
                // Never wrap on top of a chain that may still be in place.
                if !self.teardown_checked("stale capture").await? {
                    return Ok(Err(PassFailure::TeardownUnconfirmed));
                }
                report.tore_down = true;
            }
            InstallStatus::NotInstalled => {}
        }

        if let Err(failure) = self.install_once().await? {
            return Ok(Err(failure));
        }
        report.reinstalled = true;

        if self.verify().await? {
            return Ok(Ok(()));
        }
        warn!("Fresh capture failed verification, tearing down");
        self.teardown_checked("unverified fresh capture").await?;
        Ok(Err(PassFailure::NotVerified))
    }

    /// Make sure capture is installed and working.
    ///
    /// Idempotent: a verified installation is left untouched and the
    /// methods it saved are never re-saved. Failures are retried up to the
    /// install attempt cap; the report's `initialized` is false after
    /// exhaustion.
    ///
    /// # Errors
    /// Returns error only if the session is lost or a command is rejected.
    pub async fn ensure(&self) -> Result<InstallReport, RelayError> {
        let clock = self.relay.clock();
        let mut budget = self.policy.start(clock.elapsed());
        let mut report = InstallReport {
            initialized: false,
            status_before: None,
            reinstalled: false,
            tore_down: false,
            attempts: 0,
        };

        while let Step::Attempt(attempt) = budget.next(clock.elapsed()) {
            report.attempts = attempt;
            match self.pass(&mut report).await? {
                Ok(()) => {
                    report.initialized = true;
                    info!(
                        attempt,
                        reinstalled = report.reinstalled,
                        "Console capture ready"
                    );
                    return Ok(report);
                }
                Err(failure) => {
                    let reason = match failure {
                        PassFailure::ProbeMissed => "probe not observed".to_string(),
                        PassFailure::InstallFailed(reason) => reason,
                        PassFailure::NotVerified => "verification token not captured".to_string(),
                        PassFailure::TeardownUnconfirmed => "teardown not confirmed".to_string(),
                    };
                    warn!(attempt, %reason, "Capture pass failed");
                }
            }

            if budget.take_escalation(clock.elapsed()) {
                diagnostic_screenshot(&self.relay, "Console capture retries past half budget")
                    .await?;
            }
            if budget.is_exhausted(clock.elapsed()) {
                break;
            }
            clock.sleep(budget.delay()).await;
        }

        warn!(attempts = report.attempts, "Console capture could not be installed");
        diagnostic_screenshot(&self.relay, "Console capture install failed").await?;
        Ok(report)
    }

    /// Empty the remote buffer. Best effort, unframed.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn clear_buffer(&self) -> Result<(), RelayError> {
        self.relay
            .issue_best_effort(Command::run_script(clear_script()))
            .await
    }

    /// Captured records, without the relay's own frames.
    ///
    /// Returns `None` when the read produced no usable frame.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn read_records(&self) -> Result<Option<Vec<ConsoleRecord>>, RelayError> {
        let result = self.relay.exchange("capture_read", &read_script()).await?;
        Ok(decode::<Vec<ConsoleRecord>>(&result).map(strip_relay_frames))
    }
}

fn decode<T: serde::de::DeserializeOwned>(result: &RelayResult) -> Option<T> {
    let value = result.payload.as_value()?;
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!("Unexpected capture payload shape: {err}");
            None
        }
    }
}

/// Drop records logged by relay frames: a start sentinel, everything up
/// to the matching end sentinel, and the end sentinel itself.
#[must_use]
pub fn strip_relay_frames(records: Vec<ConsoleRecord>) -> Vec<ConsoleRecord> {
    let mut kept = Vec::with_capacity(records.len());
    let mut open: Option<String> = None;
    for record in records {
        if let Some(token) = &open {
            if record.text.strip_suffix("_END") == Some(token.as_str()) {
                open = None;
            }
            continue;
        }
        if record.text.starts_with(MARKER_PREFIX) {
            if let Some(token) = record.text.strip_suffix("_START") {
                open = Some(token.to_string());
            }
            continue;
        }
        kept.push(record);
    }
    kept
}
