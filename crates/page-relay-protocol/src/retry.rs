//! Retry/diagnostics policy shared by relay exchanges and the installer.
//!
//! [`AttemptBudget`] is a plain state machine over an attempt counter and a
//! wall-clock budget. It never sleeps itself; callers ask it for the next
//! step and the delay, and sleep through their injected
//! [`Clock`](page_relay_core::Clock).

use std::time::Duration;

use page_relay_core::{Backoff, Command, Payload, RelayConfig, RelayResult};
use tracing::{info, warn};

use crate::relay::{ConsoleRelay, RelayError};

/// Limits for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    /// Wall-clock budget measured from the first attempt.
    pub budget: Duration,
}

impl RetryPolicy {
    /// Policy for relay calls.
    #[must_use]
    pub const fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: config.retry_delay(),
            backoff: config.backoff,
            budget: config.retry_budget(),
        }
    }

    /// Policy for installer passes.
    #[must_use]
    pub const fn for_install(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.install_attempts,
            ..Self::from_config(config)
        }
    }

    /// Start a budget at `now`.
    #[must_use]
    pub const fn start(&self, now: Duration) -> AttemptBudget {
        AttemptBudget {
            policy: *self,
            started_at: now,
            attempt: 0,
            escalated: false,
        }
    }
}

/// Next move of a bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run attempt number `n` (1-based).
    Attempt(u32),
    /// No attempts or time left.
    Exhausted,
}

/// Attempt counter, elapsed-time budget and escalation latch.
#[derive(Debug, Clone)]
pub struct AttemptBudget {
    policy: RetryPolicy,
    started_at: Duration,
    attempt: u32,
    escalated: bool,
}

impl AttemptBudget {
    /// Attempts started so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub const fn elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.started_at)
    }

    /// Whether another attempt is out of the question.
    ///
    /// The first attempt is always allowed.
    #[must_use]
    pub const fn is_exhausted(&self, now: Duration) -> bool {
        if self.attempt == 0 {
            return false;
        }
        self.attempt >= self.policy.max_attempts
            || self.elapsed(now).as_nanos() >= self.policy.budget.as_nanos()
    }

    /// Advance to the next attempt if the budget allows one.
    pub const fn next(&mut self, now: Duration) -> Step {
        if self.is_exhausted(now) {
            return Step::Exhausted;
        }
        self.attempt += 1;
        Step::Attempt(self.attempt)
    }

    /// Delay to wait after the current (failed) attempt.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.policy.backoff.delay(self.policy.delay, self.attempt)
    }

    /// Returns true exactly once, the first time more than half of either
    /// the attempt cap or the time budget has been used.
    pub fn take_escalation(&mut self, now: Duration) -> bool {
        if self.escalated {
            return false;
        }
        let attempts_past_half = self.attempt.saturating_mul(2) > self.policy.max_attempts;
        let time_past_half = self.elapsed(now).saturating_mul(2) > self.policy.budget;
        if attempts_past_half || time_past_half {
            self.escalated = true;
            return true;
        }
        false
    }
}

/// Ask the host for a screenshot, ignoring transient failure.
///
/// # Errors
/// Returns error only if the session is lost.
pub async fn diagnostic_screenshot(relay: &ConsoleRelay, note: &str) -> Result<(), RelayError> {
    info!(note, "Requesting diagnostic screenshot");
    relay.issue_best_effort(Command::screenshot(note)).await
}

/// Relay calls wrapped in the retry policy.
///
/// Each attempt uses a brand-new marker. After the cap is exhausted a
/// diagnostic screenshot is requested and a typed miss is returned.
pub struct RetryingRelay<'a> {
    relay: &'a ConsoleRelay,
    policy: RetryPolicy,
    cleanup: Option<String>,
}

impl<'a> RetryingRelay<'a> {
    #[must_use]
    pub const fn new(relay: &'a ConsoleRelay, policy: RetryPolicy) -> Self {
        Self {
            relay,
            policy,
            cleanup: None,
        }
    }

    /// Script issued (unframed, best effort) before every retry to clear
    /// stale remote state.
    #[must_use]
    pub fn with_cleanup(mut self, script: impl Into<String>) -> Self {
        self.cleanup = Some(script.into());
        self
    }

    /// Evaluate `script` until it succeeds or the budget runs out.
    ///
    /// A remote exception seen on the final attempt is returned as data;
    /// every other failure ends as `Payload::Absent` with
    /// `found_markers == false`.
    ///
    /// # Errors
    /// Returns error only for malformed scripts, rejected commands, or a
    /// lost session.
    pub async fn evaluate(&self, script: &str) -> Result<RelayResult, RelayError> {
        let clock = self.relay.clock();
        let mut budget = self.policy.start(clock.elapsed());
        let mut last = RelayResult::missed(String::new());

        while let Step::Attempt(attempt) = budget.next(clock.elapsed()) {
            let result = self.relay.evaluate(script).await?.with_attempts(attempt);
            if result.is_success() {
                if attempt > 1 {
                    info!(attempt, "Relay succeeded after retry");
                }
                return Ok(result);
            }

            warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                found_markers = result.found_markers,
                "Relay attempt failed"
            );
            last = result;

            if budget.take_escalation(clock.elapsed()) {
                diagnostic_screenshot(self.relay, "Relay retries past half budget").await?;
            }
            if budget.is_exhausted(clock.elapsed()) {
                break;
            }

            if let Some(cleanup) = &self.cleanup {
                self.relay
                    .issue_best_effort(Command::run_script(cleanup.clone()))
                    .await?;
            }
            clock.sleep(budget.delay()).await;
        }

        warn!(
            attempts = budget.attempts(),
            elapsed = ?budget.elapsed(clock.elapsed()),
            "Relay budget exhausted"
        );
        diagnostic_screenshot(self.relay, "Relay budget exhausted").await?;

        if last.found_markers && matches!(last.payload, Payload::Error(_)) {
            return Ok(last);
        }
        Ok(RelayResult::missed(last.raw_text).with_attempts(budget.attempts()))
    }
}
