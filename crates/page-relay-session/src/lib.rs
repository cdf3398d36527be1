//! Per-session orchestration for a remote page host.
//!
//! Provides:
//! - `PageSession` - The explicit session handle composing relay, capture and readiness
//! - Host implementations (`ScriptedHost`, a simulated page)

pub mod host;
pub mod manager;

pub use manager::{CaptureBelief, PageSession, SessionError};
