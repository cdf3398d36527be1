//! Line-oriented host over an executor's stdin/stdout.

use std::{
    sync::{Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use page_relay_core::{Command, HostError, RemoteHost};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::protocol::{HostReply, render_command};

/// Default wait for one reply line.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for replies still owed by timed-out commands.
pub const DEFAULT_RESYNC_GRACE: Duration = Duration::from_secs(5);

struct Channel<W, R> {
    writer: BufWriter<W>,
    lines: Lines<BufReader<R>>,
    /// Replies still owed by commands that timed out.
    owed: usize,
}

/// [`RemoteHost`] speaking the tag dialect over a writer, reading one JSON
/// reply line per command from a reader.
///
/// Write and read happen under one lock, so replies stay paired with their
/// commands. A command that times out still owes a reply; before the next
/// command is written that late reply is read and discarded, waiting at most
/// `resync_grace` for it.
pub struct StdioHost<W, R> {
    channel: Mutex<Channel<W, R>>,
    reply_timeout: Duration,
    resync_grace: Duration,
    last_screenshot: StdMutex<Option<Bytes>>,
}

impl<W, R> StdioHost<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    /// Create a host writing commands to `writer` and reading replies from `reader`.
    #[must_use]
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            channel: Mutex::new(Channel {
                writer: BufWriter::new(writer),
                lines: BufReader::new(reader).lines(),
                owed: 0,
            }),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            resync_grace: DEFAULT_RESYNC_GRACE,
            last_screenshot: StdMutex::new(None),
        }
    }

    #[must_use]
    pub const fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_resync_grace(mut self, grace: Duration) -> Self {
        self.resync_grace = grace;
        self
    }

    /// Image bytes from the most recent screenshot reply.
    #[must_use]
    pub fn last_screenshot(&self) -> Option<Bytes> {
        self.last_screenshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn send(&self, command: &Command) -> Result<HostReply, HostError> {
        let text = render_command(command).map_err(|e| HostError::Rejected(e.to_string()))?;
        let mut channel = self.channel.lock().await;
        self.resync(&mut channel).await?;

        let write = async {
            channel.writer.write_all(text.as_bytes()).await?;
            channel.writer.write_all(b"\n").await?;
            channel.writer.flush().await
        };
        write
            .await
            .map_err(|e| HostError::Disconnected(format!("executor input closed: {e}")))?;
        debug!(kind = command.kind(), bytes = text.len(), "Command sent");

        loop {
            // `next_line` is cancel safe: a timed-out read loses no data.
            let line = match tokio::time::timeout(self.reply_timeout, channel.lines.next_line())
                .await
            {
                Err(_) => {
                    channel.owed += 1;
                    return Err(HostError::Transport(format!(
                        "no reply within {:?}",
                        self.reply_timeout
                    )));
                }
                Ok(Err(e)) => {
                    return Err(HostError::Disconnected(format!(
                        "executor output failed: {e}"
                    )));
                }
                Ok(Ok(None)) => {
                    return Err(HostError::Disconnected("executor output closed".into()));
                }
                Ok(Ok(Some(line))) => line,
            };
            if line.trim().is_empty() {
                continue;
            }
            return HostReply::parse(&line).map_err(|e| {
                warn!(%line, "Unparsable executor reply");
                HostError::Transport(format!("unparsable reply: {e}"))
            });
        }
    }

    /// Discard replies owed by timed-out commands.
    ///
    /// If an owed reply does not show up within the grace period it is
    /// presumed lost and the debt is forgiven.
    async fn resync(&self, channel: &mut Channel<W, R>) -> Result<(), HostError> {
        while channel.owed > 0 {
            match tokio::time::timeout(self.resync_grace, channel.lines.next_line()).await {
                Err(_) => {
                    warn!(owed = channel.owed, "Late replies never arrived");
                    channel.owed = 0;
                }
                Ok(Err(e)) => {
                    return Err(HostError::Disconnected(format!(
                        "executor output failed: {e}"
                    )));
                }
                Ok(Ok(None)) => {
                    return Err(HostError::Disconnected("executor output closed".into()));
                }
                Ok(Ok(Some(line))) => {
                    if !line.trim().is_empty() {
                        channel.owed -= 1;
                        debug!(%line, "Discarded late reply");
                    }
                }
            }
        }
        Ok(())
    }

    fn keep_screenshot(&self, reply: &HostReply) {
        match reply.decode_screenshot() {
            Ok(Some(image)) => {
                debug!(bytes = image.len(), "Screenshot received");
                *self
                    .last_screenshot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(image);
            }
            Ok(None) => {}
            Err(e) => warn!("Discarding screenshot: {e}"),
        }
    }
}

#[async_trait]
impl<W, R> RemoteHost for StdioHost<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    async fn issue(&self, command: Command) -> Result<(), HostError> {
        if command == Command::DrainLog {
            return self.drain_log().await.map(|_| ());
        }
        let reply = self.send(&command).await?;
        if let Some(err) = reply.host_error() {
            return Err(err);
        }
        self.keep_screenshot(&reply);
        Ok(())
    }

    async fn drain_log(&self) -> Result<String, HostError> {
        let reply = self.send(&Command::DrainLog).await?;
        if let Some(err) = reply.host_error() {
            return Err(err);
        }
        match reply {
            HostReply::Console { text } => Ok(text),
            HostReply::Ack => Ok(String::new()),
            other => Err(HostError::Transport(format!(
                "unexpected reply to log drain: {other:?}"
            ))),
        }
    }
}
