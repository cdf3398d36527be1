//! Core traits for the command boundary.

use async_trait::async_trait;
use thiserror::Error;

use crate::Command;

/// Remote host error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The channel hiccuped; the same command may succeed later.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The executor refused the command as written.
    #[error("Command rejected: {0}")]
    Rejected(String),
    /// The remote session is gone for good.
    #[error("Remote session lost: {0}")]
    Disconnected(String),
}

/// Trait for the remote page host's command channel.
///
/// Implementations deliver commands in the order they are issued. Script
/// effects only become observable later, through `drain_log`.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Hand a command to the executor.
    ///
    /// Returning `Ok` means the command was delivered, not that it ran.
    async fn issue(&self, command: Command) -> Result<(), HostError>;

    /// Return the entire currently available log text.
    ///
    /// An empty string is a valid answer meaning nothing has been logged yet.
    async fn drain_log(&self) -> Result<String, HostError>;
}
