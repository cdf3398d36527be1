//! Tunables for relay exchanges, retries and readiness waits.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
}

/// Delay growth between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay every time.
    #[default]
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`, capped at `max_ms`.
    Exponential { max_ms: u64 },
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(self, base: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed => base,
            Self::Linear => base.saturating_mul(attempt),
            Self::Exponential { max_ms } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(Duration::from_millis(max_ms))
            }
        }
    }
}

/// Relay and retry configuration.
///
/// Durations are expressed in milliseconds so the struct maps directly onto
/// a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Wait between issuing a script and each drain of the log.
    pub settle_delay_ms: u64,
    /// Drains attempted per exchange before declaring the markers missing.
    pub drain_probes: u32,
    /// Exchanges attempted per retried relay call.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub retry_delay_ms: u64,
    /// Wall-clock budget for one retried relay call.
    pub retry_budget_ms: u64,
    pub backoff: Backoff,
    /// Empty the capture buffer between failed attempts when capture is installed.
    pub clear_stale_capture: bool,
    /// Full probe/install/verify passes attempted by the installer.
    pub install_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            drain_probes: 3,
            max_attempts: 3,
            retry_delay_ms: 1_000,
            retry_budget_ms: 30_000,
            backoff: Backoff::Fixed,
            clear_stale_capture: true,
            install_attempts: 3,
        }
    }
}

impl RelayConfig {
    /// Parse and validate a JSON config. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or a count is zero.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the protocol relies on.
    ///
    /// # Errors
    /// Returns error if an attempt or probe count is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_probes == 0 {
            return Err(ConfigError::Zero {
                field: "drain_probes",
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }
        if self.install_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "install_attempts",
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub const fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }
}

/// Options for one readiness wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitOptions {
    pub max_wait_ms: u64,
    pub check_interval_ms: u64,
    /// CSS selector that must match at least one visible element.
    pub content_selector: Option<String>,
    /// CSS selector whose presence marks a page error.
    pub error_selector: String,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            max_wait_ms: 30_000,
            check_interval_ms: 2_000,
            content_selector: None,
            error_selector: ".error-message, .error".to_string(),
        }
    }
}

impl WaitOptions {
    /// Create options with the given budget and poll interval.
    #[must_use]
    pub fn new(max_wait: Duration, check_interval: Duration) -> Self {
        Self {
            max_wait_ms: u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX),
            check_interval_ms: u64::try_from(check_interval.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    /// Require content matching `selector` to be present and visible.
    #[must_use]
    pub fn with_content_selector<S: Into<String>>(mut self, selector: S) -> Self {
        self.content_selector = Some(selector.into());
        self
    }

    /// Check that the wait can make progress without spinning.
    ///
    /// # Errors
    /// Returns error if the poll interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "check_interval_ms",
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}
