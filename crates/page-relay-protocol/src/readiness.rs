//! Readiness polling.
//!
//! A wait is a small state machine, `Polling -> Ready | Failed | Timeout`,
//! fed by one probe exchange per iteration. [`ReadinessMachine`] holds the
//! transitions and the screenshot schedule; [`ReadinessPoller`] drives it
//! through the relay and the injected clock.

use std::time::Duration;

use page_relay_core::{
    RelayResult, WaitOptions,
    script::{js_string, tagged},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    relay::{ConsoleRelay, RelayError},
    retry::diagnostic_screenshot,
};

const PROBE_JS: &str = r#"const selector = %SELECTOR%;
const errorSelector = %ERROR_SELECTOR%;
const resources = window.performance && window.performance.getEntriesByType
  ? window.performance.getEntriesByType("resource")
  : [];
const state = {
  readyState: document.readyState,
  url: window.location.href,
  title: document.title,
  bodyLength: document.body ? document.body.innerHTML.length : 0,
  networkIdle: resources.every((r) => r.responseEnd > 0),
  hasError: !!document.querySelector(errorSelector),
  contentCheck: null,
};
if (selector !== null) {
  const elements = Array.from(document.querySelectorAll(selector));
  state.contentCheck = {
    found: elements.length > 0,
    count: elements.length,
    visible: elements.some((el) => {
      const style = window.getComputedStyle(el);
      return style.display !== "none" && style.visibility !== "hidden";
    }),
  };
}
return state;"#;

/// Build the probe script for one readiness iteration.
#[must_use]
pub fn probe_script(options: &WaitOptions) -> String {
    let selector = options
        .content_selector
        .as_deref()
        .map_or_else(|| "null".to_string(), js_string);
    let body = PROBE_JS
        .replace("%SELECTOR%", &selector)
        .replace("%ERROR_SELECTOR%", &js_string(&options.error_selector));
    tagged("readiness-probe", &body)
}

/// Content and error selectors embedded in a script built by [`probe_script`].
#[must_use]
pub fn probe_selectors(script: &str) -> Option<(Option<String>, String)> {
    let content = declared_literal(script, "selector")?;
    let error = declared_literal(script, "errorSelector")?;
    let content = match content {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        _ => return None,
    };
    let serde_json::Value::String(error) = error else {
        return None;
    };
    Some((content, error))
}

fn declared_literal(script: &str, name: &str) -> Option<serde_json::Value> {
    let decl = format!("const {name} = ");
    let start = script.find(&decl)? + decl.len();
    let end = start + script[start..].find(";\n")?;
    serde_json::from_str(&script[start..end]).ok()
}

/// Where a wait currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Polling,
    Ready,
    Failed,
    Timeout,
}

/// Result of the optional content-selector check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentCheck {
    pub found: bool,
    pub visible: bool,
    pub count: u64,
}

/// One probe's view of the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessState {
    pub ready_state: String,
    pub body_length: u64,
    pub network_idle: bool,
    /// The probe result came back through a console frame.
    pub console_working: bool,
    pub has_error: bool,
    pub content_check: Option<ContentCheck>,
    pub url: String,
    pub title: String,
    pub success: bool,
    /// Unmet conditions, for diagnostics.
    pub errors: Vec<String>,
}

impl ReadinessState {
    /// Decode a probe result. `None` if the probe was missed, threw, or
    /// produced an unexpected shape.
    #[must_use]
    pub fn from_result(result: &RelayResult, content_required: bool) -> Option<Self> {
        let value = result.payload.as_value()?;
        let state: Self = serde_json::from_value(value.clone())
            .map_err(|err| debug!("Unexpected probe payload: {err}"))
            .ok()?;
        Some(state.assess(content_required))
    }

    /// Fill in `success`, `errors` and `console_working` from the raw fields.
    #[must_use]
    pub fn assess(mut self, content_required: bool) -> Self {
        self.console_working = true;
        self.errors.clear();

        if self.ready_state != "complete" {
            self.errors
                .push(format!("Document not complete ({})", self.ready_state));
        }
        if self.body_length == 0 {
            self.errors.push("Empty body".to_string());
        }
        if !self.network_idle {
            self.errors.push("Network not idle".to_string());
        }
        let content_ok = if content_required {
            match self.content_check {
                Some(check) if check.found && check.visible => true,
                Some(check) if check.found => {
                    self.errors.push("Required content not visible".to_string());
                    false
                }
                _ => {
                    self.errors.push("Required content not found".to_string());
                    false
                }
            }
        } else {
            true
        };
        if self.has_error {
            self.errors.push("Error indicator present".to_string());
        }

        self.success = self.ready_state == "complete"
            && self.body_length > 0
            && self.network_idle
            && content_ok;
        self
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready {
        state: ReadinessState,
        elapsed: Duration,
        iterations: u32,
    },
    /// The page showed an error indicator.
    Failed {
        state: ReadinessState,
        elapsed: Duration,
        iterations: u32,
    },
    TimedOut {
        last: Option<ReadinessState>,
        elapsed: Duration,
        iterations: u32,
    },
}

impl ReadinessOutcome {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    #[must_use]
    pub const fn poll_state(&self) -> PollState {
        match self {
            Self::Ready { .. } => PollState::Ready,
            Self::Failed { .. } => PollState::Failed,
            Self::TimedOut { .. } => PollState::Timeout,
        }
    }

    /// Latest probe seen before the wait ended.
    #[must_use]
    pub const fn last_state(&self) -> Option<&ReadinessState> {
        match self {
            Self::Ready { state, .. } | Self::Failed { state, .. } => Some(state),
            Self::TimedOut { last, .. } => last.as_ref(),
        }
    }

    #[must_use]
    pub const fn elapsed(&self) -> Duration {
        match self {
            Self::Ready { elapsed, .. }
            | Self::Failed { elapsed, .. }
            | Self::TimedOut { elapsed, .. } => *elapsed,
        }
    }

    #[must_use]
    pub const fn iterations(&self) -> u32 {
        match self {
            Self::Ready { iterations, .. }
            | Self::Failed { iterations, .. }
            | Self::TimedOut { iterations, .. } => *iterations,
        }
    }
}

/// Transitions of one readiness wait, free of I/O.
#[derive(Debug, Clone)]
pub struct ReadinessMachine {
    max_wait: Duration,
    interval: Duration,
    state: PollState,
    iterations: u32,
    latest: Option<ReadinessState>,
    screenshot_taken: bool,
}

impl ReadinessMachine {
    #[must_use]
    pub fn new(options: &WaitOptions) -> Self {
        Self {
            max_wait: options.max_wait(),
            interval: options.check_interval(),
            state: PollState::Polling,
            iterations: 0,
            latest: None,
            screenshot_taken: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> PollState {
        self.state
    }

    #[must_use]
    pub const fn iterations(&self) -> u32 {
        self.iterations
    }

    #[must_use]
    pub const fn latest(&self) -> Option<&ReadinessState> {
        self.latest.as_ref()
    }

    /// Record one probe. `None` means the probe produced nothing usable,
    /// which only counts as "not ready yet".
    pub fn observe(&mut self, probe: Option<ReadinessState>) -> PollState {
        self.iterations += 1;
        let Some(probe) = probe else {
            return self.state;
        };
        if probe.success {
            self.state = PollState::Ready;
        } else if probe.has_error {
            self.state = PollState::Failed;
        }
        self.latest = Some(probe);
        self.state
    }

    /// Sleep before the next probe, or `None` if the budget is spent.
    #[must_use]
    pub fn next_sleep(&self, elapsed: Duration) -> Option<Duration> {
        let remaining = self.max_wait.checked_sub(elapsed)?;
        if remaining.is_zero() {
            return None;
        }
        Some(self.interval.min(remaining))
    }

    /// Returns true once, the first time more than half of the budget is spent.
    pub fn take_screenshot_slot(&mut self, elapsed: Duration) -> bool {
        if self.screenshot_taken || elapsed.saturating_mul(2) <= self.max_wait {
            return false;
        }
        self.screenshot_taken = true;
        true
    }

    /// Move to `Timeout` if the budget is spent.
    pub fn check_deadline(&mut self, elapsed: Duration) -> PollState {
        if self.state == PollState::Polling && elapsed >= self.max_wait {
            self.state = PollState::Timeout;
        }
        self.state
    }
}

/// Blocks (cooperatively) until the page is usable.
#[derive(Clone)]
pub struct ReadinessPoller {
    relay: ConsoleRelay,
}

impl ReadinessPoller {
    #[must_use]
    pub const fn new(relay: ConsoleRelay) -> Self {
        Self { relay }
    }

    /// Run one probe exchange.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn probe(&self, options: &WaitOptions) -> Result<Option<ReadinessState>, RelayError> {
        let result = self
            .relay
            .exchange("readiness", &probe_script(options))
            .await?;
        if !result.found_markers {
            debug!("Readiness probe not observed");
        }
        Ok(ReadinessState::from_result(
            &result,
            options.content_selector.is_some(),
        ))
    }

    /// Poll until ready, failed, or out of time.
    ///
    /// # Errors
    /// Returns error if the session is lost or the poll interval is zero.
    pub async fn wait(&self, options: &WaitOptions) -> Result<ReadinessOutcome, RelayError> {
        options.validate()?;
        let clock = self.relay.clock();
        let started = clock.elapsed();
        let mut machine = ReadinessMachine::new(options);
        info!(
            max_wait = ?options.max_wait(),
            interval = ?options.check_interval(),
            selector = ?options.content_selector,
            "Waiting for page readiness"
        );

        loop {
            let probe = self.probe(options).await?;
            let state = machine.observe(probe);
            let elapsed = clock.elapsed().saturating_sub(started);

            match state {
                PollState::Ready => {
                    info!(?elapsed, iterations = machine.iterations(), "Page ready");
                    return Ok(ReadinessOutcome::Ready {
                        state: machine.latest.take().unwrap_or_default(),
                        elapsed,
                        iterations: machine.iterations(),
                    });
                }
                PollState::Failed => {
                    warn!(?elapsed, "Page error indicator present");
                    return Ok(ReadinessOutcome::Failed {
                        state: machine.latest.take().unwrap_or_default(),
                        elapsed,
                        iterations: machine.iterations(),
                    });
                }
                PollState::Polling | PollState::Timeout => {}
            }

            if let Some(latest) = machine.latest() {
                debug!(errors = ?latest.errors, "Page not ready yet");
            }

            if let Some(pause) = machine.next_sleep(elapsed) {
                clock.sleep(pause).await;
            }
            let elapsed = clock.elapsed().saturating_sub(started);

            if machine.check_deadline(elapsed) == PollState::Timeout {
                warn!(?elapsed, iterations = machine.iterations(), "Readiness wait timed out");
                diagnostic_screenshot(&self.relay, "Readiness wait timed out").await?;
                return Ok(ReadinessOutcome::TimedOut {
                    last: machine.latest.take(),
                    elapsed,
                    iterations: machine.iterations(),
                });
            }
            if machine.take_screenshot_slot(elapsed) {
                diagnostic_screenshot(&self.relay, "Checking page state during wait").await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use page_relay_core::{Clock, ManualClock, RelayConfig, script::tag_of};
    use serde_json::json;

    use super::*;
    use crate::testing::{EchoHost, Reply};

    fn opts(max_secs: u64, interval_secs: u64) -> WaitOptions {
        WaitOptions::new(
            Duration::from_secs(max_secs),
            Duration::from_secs(interval_secs),
        )
    }

    fn probe_host(state: serde_json::Value) -> Arc<EchoHost> {
        Arc::new(EchoHost::new(move |body| {
            if tag_of(body) == Some("readiness-probe") {
                Reply::Frame(state.to_string())
            } else {
                Reply::Silent
            }
        }))
    }

    fn poller(host: Arc<EchoHost>) -> (ReadinessPoller, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = RelayConfig {
            settle_delay_ms: 0,
            ..RelayConfig::default()
        };
        (
            ReadinessPoller::new(ConsoleRelay::new(host, clock.clone(), config)),
            clock,
        )
    }

    fn complete() -> serde_json::Value {
        json!({
            "readyState": "complete",
            "bodyLength": 2048,
            "networkIdle": true,
            "hasError": false,
            "contentCheck": null,
            "url": "https://example.edu/programs",
            "title": "Programs"
        })
    }

    #[test]
    fn test_probe_script_embeds_selectors() {
        let options = opts(5, 1).with_content_selector("table.programs tr");
        let script = probe_script(&options);
        assert_eq!(tag_of(&script), Some("readiness-probe"));
        assert_eq!(
            probe_selectors(&script),
            Some((
                Some("table.programs tr".to_string()),
                ".error-message, .error".to_string()
            ))
        );
        assert_eq!(
            probe_selectors(&probe_script(&opts(5, 1))),
            Some((None, ".error-message, .error".to_string()))
        );
    }

    #[test]
    fn test_assess_collects_every_unmet_condition() {
        let raw: ReadinessState = serde_json::from_value(json!({
            "readyState": "interactive",
            "bodyLength": 0,
            "networkIdle": false,
            "hasError": false,
            "contentCheck": { "found": true, "visible": false, "count": 3 }
        }))
        .unwrap();
        let state = raw.assess(true);
        assert!(!state.success);
        assert!(state.console_working);
        assert_eq!(
            state.errors,
            vec![
                "Document not complete (interactive)",
                "Empty body",
                "Network not idle",
                "Required content not visible",
            ]
        );
    }

    #[test]
    fn test_content_required_but_unchecked() {
        let raw: ReadinessState = serde_json::from_value(complete()).unwrap();
        assert!(raw.clone().assess(false).success);
        let state = raw.assess(true);
        assert!(!state.success);
        assert_eq!(state.errors, vec!["Required content not found"]);
    }

    #[test]
    fn test_machine_screenshot_slot_once() {
        let mut machine = ReadinessMachine::new(&opts(10, 1));
        assert!(!machine.take_screenshot_slot(Duration::from_secs(5)));
        assert!(machine.take_screenshot_slot(Duration::from_secs(6)));
        assert!(!machine.take_screenshot_slot(Duration::from_secs(7)));
        assert_eq!(machine.next_sleep(Duration::from_millis(9_500)), Some(Duration::from_millis(500)));
        assert_eq!(machine.next_sleep(Duration::from_secs(10)), None);
    }

    #[tokio::test]
    async fn test_ready_on_first_iteration() {
        let host = probe_host(complete());
        let (poller, clock) = poller(host.clone());

        let outcome = poller.wait(&opts(30, 2)).await.unwrap();
        assert!(outcome.is_ready());
        assert_eq!(outcome.iterations(), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert_eq!(host.screenshots(), 0);
        let state = outcome.last_state().unwrap();
        assert!(state.console_working);
        assert_eq!(state.title, "Programs");
    }

    #[tokio::test]
    async fn test_error_indicator_short_circuits() {
        let mut state = complete();
        state["readyState"] = json!("loading");
        state["hasError"] = json!(true);
        let host = probe_host(state);
        let (poller, _) = poller(host);

        let outcome = poller.wait(&opts(30, 2)).await.unwrap();
        assert_eq!(outcome.poll_state(), PollState::Failed);
        assert_eq!(outcome.iterations(), 1);
    }

    #[tokio::test]
    async fn test_timeout_after_budget() {
        let mut state = complete();
        state["readyState"] = json!("loading");
        let host = probe_host(state);
        let (poller, clock) = poller(host.clone());

        let outcome = poller.wait(&opts(5, 1)).await.unwrap();
        assert_eq!(outcome.poll_state(), PollState::Timeout);
        assert_eq!(outcome.elapsed(), Duration::from_secs(5));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
        assert_eq!(outcome.iterations(), 5);
        // Once past half the budget, once at timeout.
        assert_eq!(host.screenshots(), 2);
        assert!(outcome.last_state().unwrap().errors[0].starts_with("Document not complete"));
    }

    #[tokio::test]
    async fn test_missed_probes_count_as_not_ready() {
        let host = Arc::new(EchoHost::new(|_| Reply::Noise("unrelated chatter".into())));
        let (poller, _) = poller(host);

        let outcome = poller.wait(&opts(3, 1)).await.unwrap();
        assert!(matches!(
            outcome,
            ReadinessOutcome::TimedOut { last: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_zero_interval_refused_before_probing() {
        let host = Arc::new(EchoHost::new(|_| Reply::Noise("unrelated chatter".into())));
        let (poller, clock) = poller(host.clone());

        let err = poller
            .wait(&WaitOptions::new(Duration::from_secs(5), Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidOptions(_)));
        assert!(host.commands().is_empty());
        assert_eq!(clock.sleep_count(), 0);
    }

    #[tokio::test]
    async fn test_content_selector_gates_readiness() {
        let mut state = complete();
        state["contentCheck"] = json!({ "found": true, "visible": true, "count": 12 });
        let host = probe_host(state);
        let (poller, _) = poller(host);

        let options = opts(10, 1).with_content_selector("table tr");
        let outcome = poller.wait(&options).await.unwrap();
        assert!(outcome.is_ready());
        assert_eq!(outcome.last_state().unwrap().content_check.unwrap().count, 12);
    }
}
