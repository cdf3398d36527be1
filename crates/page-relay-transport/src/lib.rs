//! Transport to a real executor.
//!
//! Provides:
//! - Command dialect (tag blocks out, JSON reply lines back)
//! - `StdioHost` - `RemoteHost` over any async writer/reader pair

pub mod protocol;
pub mod stdio;

pub use protocol::{HostReply, ProtocolError, render_command};
pub use stdio::StdioHost;
