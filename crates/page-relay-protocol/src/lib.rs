//! Console relay protocol over a remote page host's text log.
//!
//! - `relay` - Marker-framed request/response exchanges
//! - `installer` - Idempotent console capture with teardown and verification
//! - `readiness` - Bounded readiness polling state machine
//! - `retry` - Attempt budgets, backoff and diagnostic escalation

pub mod installer;
pub mod readiness;
pub mod relay;
pub mod retry;

#[cfg(test)]
mod testing;

pub use installer::{
    CAPTURE_SIGNATURE, InstallReport, InstallStatus, InstallationState, Installer, WrapState,
};
pub use readiness::{
    ContentCheck, PollState, ReadinessMachine, ReadinessOutcome, ReadinessPoller, ReadinessState,
};
pub use relay::{ConsoleRelay, FramedScript, RelayError, frame_script};
pub use retry::{AttemptBudget, RetryPolicy, RetryingRelay, Step};
