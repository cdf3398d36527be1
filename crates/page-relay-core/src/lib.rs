//! Core types for driving a remote page host through its console log.
//!
//! This crate provides the leaf building blocks:
//! - `Command` - Opaque instructions for the remote executor
//! - `RemoteHost` - The command boundary (including the log drain)
//! - `Clock` - Injectable time source for every wait and retry delay
//! - `Marker` - Collision-resistant sentinels framing one exchange
//! - `Payload` / `RelayResult` - Typed results of a relay exchange
//! - `ConsoleStore` - Bounded history + broadcast of captured console records
//! - `RelayConfig` / `WaitOptions` - Tunables

pub mod clock;
pub mod command;
pub mod config;
pub mod console_store;
pub mod marker;
pub mod payload;
pub mod script;
pub mod traits;

pub use clock::{Clock, ManualClock, TokioClock};
pub use command::Command;
pub use config::{Backoff, ConfigError, RelayConfig, WaitOptions};
pub use console_store::{ConsoleLevel, ConsoleRecord, ConsoleStore};
pub use marker::{MARKER_PREFIX, Marker, new_marker};
pub use payload::{Payload, RelayResult, scan_json_fragments};
pub use traits::{HostError, RemoteHost};
