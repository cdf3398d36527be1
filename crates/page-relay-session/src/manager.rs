//! Page session: the explicit handle for one remote page.

use std::sync::Arc;

use page_relay_core::{
    Clock, Command, ConfigError, ConsoleRecord, Payload, RelayConfig, RelayResult, RemoteHost,
    TokioClock, WaitOptions,
};
use page_relay_protocol::{
    ConsoleRelay, InstallReport, Installer, ReadinessOutcome, ReadinessPoller, RelayError,
    RetryPolicy, RetryingRelay, installer::clear_script, retry::diagnostic_screenshot,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// What the session believes about console capture in the page.
///
/// Only a hint: capture is re-verified whenever it is `Suspect` or `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBelief {
    /// Never installed in this session.
    Unknown,
    /// Installed and verified since the last reset.
    Installed,
    /// The page may have been reset since the last verification.
    Suspect,
}

/// One remote page session.
///
/// Every public operation holds the session lock for its whole duration, so
/// at most one command/drain sequence is in flight even when the handle is
/// shared between tasks.
pub struct PageSession {
    relay: ConsoleRelay,
    installer: Installer,
    poller: ReadinessPoller,
    policy: RetryPolicy,
    belief: Mutex<CaptureBelief>,
}

impl PageSession {
    /// Create a session over `host`.
    ///
    /// # Errors
    /// Returns error if `config` fails validation.
    pub fn new(
        host: Arc<dyn RemoteHost>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let policy = RetryPolicy::from_config(&config);
        let relay = ConsoleRelay::new(host, clock, config);
        Ok(Self {
            installer: Installer::new(relay.clone()),
            poller: ReadinessPoller::new(relay.clone()),
            relay,
            policy,
            belief: Mutex::new(CaptureBelief::Unknown),
        })
    }

    /// Create a session that sleeps on the tokio timer.
    ///
    /// # Errors
    /// Returns error if `config` fails validation.
    pub fn with_tokio_clock(
        host: Arc<dyn RemoteHost>,
        config: RelayConfig,
    ) -> Result<Self, SessionError> {
        Self::new(host, Arc::new(TokioClock::new()), config)
    }

    #[must_use]
    pub const fn relay(&self) -> &ConsoleRelay {
        &self.relay
    }

    pub async fn belief(&self) -> CaptureBelief {
        *self.belief.lock().await
    }

    /// Install console capture if it is not installed and working.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn ensure_capture(&self) -> Result<InstallReport, SessionError> {
        let mut belief = self.belief.lock().await;
        Ok(self.ensure_capture_locked(&mut belief).await?)
    }

    async fn ensure_capture_locked(
        &self,
        belief: &mut CaptureBelief,
    ) -> Result<InstallReport, RelayError> {
        let report = self.installer.ensure().await?;
        *belief = if report.initialized {
            CaptureBelief::Installed
        } else {
            CaptureBelief::Unknown
        };
        Ok(report)
    }

    /// Load `url`. Capture is assumed lost until re-verified.
    ///
    /// # Errors
    /// Returns error if the session is lost or navigation is rejected.
    pub async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        let mut belief = self.belief.lock().await;
        info!(url, "Navigating");
        self.relay
            .issue_best_effort(Command::navigate(url))
            .await?;
        if *belief == CaptureBelief::Installed {
            *belief = CaptureBelief::Suspect;
        }
        Ok(())
    }

    /// Block until the page is usable, shows an error, or the wait times out.
    ///
    /// # Errors
    /// Returns error if the session is lost or the poll interval is zero.
    pub async fn wait_until_ready(
        &self,
        options: &WaitOptions,
    ) -> Result<ReadinessOutcome, SessionError> {
        options.validate()?;
        let _guard = self.belief.lock().await;
        Ok(self.poller.wait(options).await?)
    }

    /// Evaluate `script` with retries.
    ///
    /// Between failed attempts the capture buffer is emptied when capture
    /// is installed and `clear_stale_capture` is set.
    ///
    /// # Errors
    /// Returns error for malformed scripts or a lost session.
    pub async fn evaluate(&self, script: &str) -> Result<RelayResult, SessionError> {
        let belief = self.belief.lock().await;
        Ok(self.evaluate_locked(*belief, script).await?)
    }

    async fn evaluate_locked(
        &self,
        belief: CaptureBelief,
        script: &str,
    ) -> Result<RelayResult, RelayError> {
        let mut retrying = RetryingRelay::new(&self.relay, self.policy);
        if belief == CaptureBelief::Installed && self.relay.config().clear_stale_capture {
            retrying = retrying.with_cleanup(clear_script());
        }
        retrying.evaluate(script).await
    }

    /// Evaluate a single expression with retries.
    ///
    /// # Errors
    /// See [`PageSession::evaluate`].
    pub async fn evaluate_expression(&self, expression: &str) -> Result<RelayResult, SessionError> {
        if expression.trim().is_empty() {
            return Err(RelayError::EmptyScript.into());
        }
        self.evaluate(&format!("return ({expression});")).await
    }

    /// Current document markup, if it could be relayed.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn page_html(&self) -> Result<Option<String>, SessionError> {
        let result = self
            .evaluate("return document.documentElement.outerHTML;")
            .await?;
        Ok(match result.payload {
            Payload::Parsed(Value::String(html)) | Payload::Raw(html) => Some(html),
            _ => {
                warn!("Page markup not retrieved");
                None
            }
        })
    }

    /// Records captured from the page console.
    ///
    /// Capture is re-verified first unless it is believed installed.
    /// Returns `None` when capture cannot be installed or read.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn console_records(&self) -> Result<Option<Vec<ConsoleRecord>>, SessionError> {
        let mut belief = self.belief.lock().await;
        if *belief != CaptureBelief::Installed {
            let report = self.ensure_capture_locked(&mut belief).await?;
            if !report.initialized {
                return Ok(None);
            }
        }
        Ok(self.installer.read_records().await?)
    }

    /// Click an element addressed by an executor selector such as `box=12`.
    ///
    /// # Errors
    /// Returns error if the session is lost or the click is rejected.
    pub async fn click(&self, selector: &str) -> Result<(), SessionError> {
        let _guard = self.belief.lock().await;
        self.relay
            .issue_best_effort(Command::click(selector))
            .await?;
        Ok(())
    }

    /// Ask the executor itself to pause.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn host_wait(&self, seconds: u64) -> Result<(), SessionError> {
        let _guard = self.belief.lock().await;
        self.relay
            .issue_best_effort(Command::Wait { seconds })
            .await?;
        Ok(())
    }

    /// Request a screenshot annotated with `note`.
    ///
    /// # Errors
    /// Returns error if the session is lost.
    pub async fn screenshot(&self, note: &str) -> Result<(), SessionError> {
        let _guard = self.belief.lock().await;
        diagnostic_screenshot(&self.relay, note).await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "scripted"))]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use page_relay_core::{ConsoleLevel, ManualClock};
    use page_relay_protocol::{InstallStatus, PollState};
    use serde_json::json;

    use super::*;
    use crate::host::{ContentModel, PageModel, ScriptReply, ScriptedHost};

    fn session_over(host: Arc<ScriptedHost>) -> (PageSession, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let session = PageSession::new(host, clock.clone(), RelayConfig::default()).unwrap();
        (session, clock)
    }

    fn quick_config() -> RelayConfig {
        RelayConfig {
            settle_delay_ms: 0,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_install_evaluate_reinstall() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let (session, _) = session_over(host.clone());

        let first = session.ensure_capture().await.unwrap();
        assert!(first.initialized);
        assert!(first.reinstalled);
        let originals = host.original_method_ids().unwrap();

        let result = session.evaluate("return 1+1").await.unwrap();
        assert!(result.found_markers);
        assert_eq!(result.payload, Payload::Parsed(json!(2)));

        let second = session.ensure_capture().await.unwrap();
        assert!(second.initialized);
        assert!(!second.reinstalled);
        assert_eq!(second.status_before, Some(InstallStatus::Installed));
        assert_eq!(host.original_method_ids().unwrap(), originals);
        assert_eq!(host.installs(), 1);
        assert_eq!(session.belief().await, CaptureBelief::Installed);
    }

    #[tokio::test]
    async fn test_stale_wrappers_torn_down_before_install() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        host.simulate_stale_wrappers();
        let (session, _) = session_over(host.clone());

        let report = session.ensure_capture().await.unwrap();
        assert!(report.initialized);
        assert!(report.tore_down);
        assert!(matches!(
            report.status_before,
            Some(InstallStatus::Stale { .. })
        ));
        assert_eq!(host.teardowns(), 1);
        assert!(!host.console_is_half_wrapped());
        let originals = host.original_method_ids().unwrap();
        assert_eq!(originals.len(), ConsoleLevel::ALL.len());
    }

    #[tokio::test]
    async fn test_orphaned_flag_is_stale() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        host.simulate_orphaned_flag();
        let (session, _) = session_over(host.clone());

        let report = session.ensure_capture().await.unwrap();
        assert!(report.initialized);
        assert!(report.tore_down);
        assert_eq!(host.installs(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_never_leaves_half_wrapped_console() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        host.fail_next_installs(u32::MAX);
        let (session, _) = session_over(host.clone());

        let report = session.ensure_capture().await.unwrap();
        assert!(!report.initialized);
        assert!(!host.console_is_half_wrapped());
        assert!(host.console_is_native());
        assert!(host.screenshots() >= 1);
        assert_eq!(session.belief().await, CaptureBelief::Unknown);
    }

    #[tokio::test]
    async fn test_install_recovers_after_one_failure() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        host.fail_next_installs(1);
        let (session, _) = session_over(host.clone());

        let report = session.ensure_capture().await.unwrap();
        assert!(report.initialized);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn test_readiness_times_out_after_budget() {
        let host = Arc::new(ScriptedHost::new(PageModel {
            ready_state: "interactive".into(),
            ..PageModel::default()
        }));
        let clock = Arc::new(ManualClock::new());
        let session = PageSession::new(host.clone(), clock.clone(), quick_config()).unwrap();

        let options = WaitOptions::new(Duration::from_secs(5), Duration::from_secs(1));
        let outcome = session.wait_until_ready(&options).await.unwrap();

        assert_eq!(outcome.poll_state(), PollState::Timeout);
        let elapsed = clock.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed <= Duration::from_secs(6));
        assert_eq!(host.screenshots(), 2);
    }

    #[tokio::test]
    async fn test_readiness_zero_interval_rejected() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let (session, clock) = session_over(host.clone());

        let options = WaitOptions::new(Duration::from_secs(5), Duration::ZERO);
        let err = session.wait_until_ready(&options).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Config(ConfigError::Zero {
                field: "check_interval_ms"
            })
        ));
        assert!(host.commands().is_empty());
        assert_eq!(clock.sleep_count(), 0);
    }

    #[tokio::test]
    async fn test_readiness_first_iteration_success() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let (session, _) = session_over(host);

        let outcome = session
            .wait_until_ready(&WaitOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_ready());
        assert_eq!(outcome.iterations(), 1);
    }

    #[tokio::test]
    async fn test_readiness_error_short_circuits() {
        let host = Arc::new(ScriptedHost::new(PageModel {
            ready_state: "loading".into(),
            has_error: true,
            ..PageModel::default()
        }));
        let (session, _) = session_over(host);

        let outcome = session
            .wait_until_ready(&WaitOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.poll_state(), PollState::Failed);
        assert_eq!(outcome.iterations(), 1);
    }

    #[tokio::test]
    async fn test_readiness_waits_for_load_and_content() {
        let host = Arc::new(ScriptedHost::new(PageModel {
            loading_probes: 2,
            content: Some(ContentModel {
                selector: "table.programs tr".into(),
                count: 40,
                visible: true,
            }),
            ..PageModel::default()
        }));
        let clock = Arc::new(ManualClock::new());
        let session = PageSession::new(host, clock.clone(), quick_config()).unwrap();

        let options = WaitOptions::new(Duration::from_secs(30), Duration::from_secs(2))
            .with_content_selector("table.programs tr");
        let outcome = session.wait_until_ready(&options).await.unwrap();
        assert!(outcome.is_ready());
        assert_eq!(outcome.iterations(), 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_relay_retries_lost_frame() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        host.drop_next_frames(1);
        let (session, _) = session_over(host.clone());

        let result = session.evaluate("return [1,2,3];").await.unwrap();
        assert_eq!(result.payload, Payload::Parsed(json!([1, 2, 3])));
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_late_old_marker_does_not_confuse_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let host = Arc::new(
            ScriptedHost::new(PageModel::default())
                .with_handler(move |_| {
                    let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                    Some(ScriptReply::Value(json!({ "attempt": n })))
                })
                .with_latency([3, 0]),
        );
        let (session, _) = session_over(host.clone());

        let result = session.evaluate("return collect();").await.unwrap();
        assert_eq!(result.payload, Payload::Parsed(json!({ "attempt": 2 })));
        // The first exchange's frame is in the log too, under its own marker.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remote_exception_is_data() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let (session, _) = session_over(host);

        let result = session.evaluate("return rows;").await.unwrap();
        assert!(result.found_markers);
        assert_eq!(result.payload, Payload::Error("rows is not defined".into()));
    }

    #[tokio::test]
    async fn test_malformed_frame_degrades_to_raw() {
        let host = Arc::new(
            ScriptedHost::new(PageModel::default())
                .with_handler(|_| Some(ScriptReply::Malformed("  <<not json>>  ".into()))),
        );
        let (session, _) = session_over(host);

        let result = session.evaluate("return weird();").await.unwrap();
        assert!(result.found_markers);
        assert_eq!(result.payload, Payload::Raw("<<not json>>".into()));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_relay_is_typed_miss() {
        let host = Arc::new(
            ScriptedHost::new(PageModel::default()).with_handler(|_| Some(ScriptReply::Silent)),
        );
        let (session, _) = session_over(host.clone());

        let result = session.evaluate("return 1;").await.unwrap();
        assert!(!result.found_markers);
        assert_eq!(result.payload, Payload::Absent);
        assert!(host.screenshots() >= 1);
    }

    #[tokio::test]
    async fn test_cleanup_clears_capture_between_attempts() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let (session, _) = session_over(host.clone());
        session.ensure_capture().await.unwrap();
        host.page_log(ConsoleLevel::Info, "stale entry");

        host.drop_next_frames(1);
        session.evaluate("return 3;").await.unwrap();
        assert!(!host.captured_texts().iter().any(|t| t == "stale entry"));
    }

    #[tokio::test]
    async fn test_console_records_reverified_after_navigation() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let (session, _) = session_over(host.clone());
        session.ensure_capture().await.unwrap();

        session.navigate("https://example.edu/grad").await.unwrap();
        assert_eq!(session.belief().await, CaptureBelief::Suspect);

        let records = session.console_records().await.unwrap().unwrap();
        assert_eq!(host.installs(), 2);
        assert!(records.iter().all(|r| !r.text.starts_with("__PAGE_RELAY_")));

        host.page_log(ConsoleLevel::Warn, "slow network");
        let records = session.console_records().await.unwrap().unwrap();
        assert!(
            records
                .iter()
                .any(|r| r.text == "slow network" && r.level == ConsoleLevel::Warn)
        );
        assert_eq!(host.installs(), 2);
    }

    #[tokio::test]
    async fn test_page_html_and_expression() {
        let host = Arc::new(ScriptedHost::new(PageModel {
            html: "<html><body><h1>Programs</h1></body></html>".into(),
            ..PageModel::default()
        }));
        let (session, _) = session_over(host);

        assert_eq!(
            session.page_html().await.unwrap().as_deref(),
            Some("<html><body><h1>Programs</h1></body></html>")
        );
        let result = session.evaluate_expression("{\"a\":1}").await.unwrap();
        assert_eq!(result.payload, Payload::Parsed(json!({"a": 1})));
        assert!(matches!(
            session.evaluate_expression("  ").await,
            Err(SessionError::Relay(RelayError::EmptyScript))
        ));
    }

    #[tokio::test]
    async fn test_commands_pass_through() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let (session, _) = session_over(host.clone());

        session.click("box=12").await.unwrap();
        session.host_wait(2).await.unwrap();
        session.screenshot("after click").await.unwrap();

        let commands = host.commands();
        assert_eq!(commands[0], Command::click("box=12"));
        assert_eq!(commands[1], Command::Wait { seconds: 2 });
        assert_eq!(commands[2], Command::screenshot("after click"));
    }

    #[tokio::test]
    async fn test_session_loss_surfaces() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let (session, _) = session_over(host.clone());
        host.disconnect();

        assert!(matches!(
            session.evaluate("return 1;").await,
            Err(SessionError::Relay(RelayError::SessionLost(_)))
        ));
        assert!(matches!(
            session.wait_until_ready(&WaitOptions::default()).await,
            Err(SessionError::Relay(RelayError::SessionLost(_)))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let host = Arc::new(ScriptedHost::new(PageModel::default()));
        let config = RelayConfig {
            max_attempts: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            PageSession::with_tokio_clock(host, config),
            Err(SessionError::Config(ConfigError::Zero { .. }))
        ));
    }
}
