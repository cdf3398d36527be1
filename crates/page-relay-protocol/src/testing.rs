//! Minimal host for unit tests: echoes framed scripts back into its log.

use std::sync::Mutex;

use async_trait::async_trait;
use page_relay_core::{Command, HostError, RemoteHost};

use crate::relay::FramedScript;

/// What the page "does" with a framed script body.
pub enum Reply {
    /// Log this text between the exchange's sentinels.
    Frame(String),
    /// Log this text without any sentinels.
    Noise(String),
    /// Log nothing.
    Silent,
}

type Responder = Box<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Default)]
struct State {
    log: Vec<String>,
    pending: Vec<(u64, String)>,
    drains: u64,
    latency: u64,
    commands: Vec<Command>,
    disconnected: bool,
    failing_drains: u32,
}

pub struct EchoHost {
    responder: Responder,
    state: Mutex<State>,
}

impl EchoHost {
    pub fn new(responder: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            state: Mutex::new(State::default()),
        }
    }

    /// Frames whatever follows `return` in the body.
    pub fn literal() -> Self {
        Self::new(|body| {
            let expr = body
                .trim()
                .trim_start_matches("return")
                .trim()
                .trim_end_matches(';')
                .trim();
            let expr = expr
                .strip_prefix('(')
                .and_then(|e| e.strip_suffix(')'))
                .unwrap_or(expr);
            Reply::Frame(expr.to_string())
        })
    }

    /// Delay each script's output by `drains` extra drains.
    pub fn with_latency(self, drains: u64) -> Self {
        self.state.lock().unwrap().latency = drains;
        self
    }

    pub fn disconnect(&self) {
        self.state.lock().unwrap().disconnected = true;
    }

    pub fn fail_next_drains(&self, count: u32) {
        self.state.lock().unwrap().failing_drains = count;
    }

    pub fn drains(&self) -> u64 {
        self.state.lock().unwrap().drains
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn screenshots(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| matches!(c, Command::Screenshot { .. }))
            .count()
    }

    pub fn framed_scripts(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| matches!(c, Command::RunScript { script } if FramedScript::parse(script).is_some()))
            .count()
    }
}

#[async_trait]
impl RemoteHost for EchoHost {
    async fn issue(&self, command: Command) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(HostError::Disconnected("page closed".into()));
        }
        if let Command::RunScript { script } = &command {
            if let Some(framed) = FramedScript::parse(script) {
                let marker = framed.marker();
                let text = match (self.responder)(framed.body) {
                    Reply::Frame(payload) => {
                        Some(format!("{}\n{payload}\n{}", marker.start(), marker.end()))
                    }
                    Reply::Noise(text) => Some(text),
                    Reply::Silent => None,
                };
                if let Some(text) = text {
                    let visible_at = state.drains + 1 + state.latency;
                    state.pending.push((visible_at, text));
                }
            }
        }
        state.commands.push(command);
        Ok(())
    }

    async fn drain_log(&self) -> Result<String, HostError> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(HostError::Disconnected("page closed".into()));
        }
        state.drains += 1;
        if state.failing_drains > 0 {
            state.failing_drains -= 1;
            return Err(HostError::Transport("executor busy".into()));
        }
        let now = state.drains;
        let (ready, waiting): (Vec<_>, Vec<_>) =
            state.pending.drain(..).partition(|(at, _)| *at <= now);
        state.pending = waiting;
        state.log.extend(ready.into_iter().map(|(_, text)| text));
        Ok(state.log.join("\n"))
    }
}
