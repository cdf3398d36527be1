//! Simulated remote page host.
//!
//! Executes the scripts this workspace composes against an in-memory page
//! model instead of a browser: the capture installer's wrappers, the
//! readiness probe and framed evaluations all have simulated effects, and
//! their console output lands in a cumulative log that `drain_log` returns.
//!
//! Knobs reproduce the channel's bad days: per-script latency, lost frames,
//! failing drains, failing installs, stale instrumentation left by an older
//! installer, navigation resets, and permanent disconnection.
//!
//! Useful for tests and demos. Nothing here touches a real page.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use page_relay_core::{
    Command, ConsoleLevel, ConsoleRecord, ConsoleStore, HostError, RemoteHost, script::tag_of,
};
use page_relay_protocol::{
    CAPTURE_SIGNATURE, FramedScript,
    installer::{CAPTURE_LIMIT, verify_token},
    readiness::probe_selectors,
};
use serde_json::{Value, json};
use tracing::debug;

/// Content matched by a selector on the simulated page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentModel {
    pub selector: String,
    pub count: u64,
    pub visible: bool,
}

/// What the simulated page reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageModel {
    pub ready_state: String,
    pub body_length: u64,
    pub network_idle: bool,
    pub has_error: bool,
    pub content: Option<ContentModel>,
    pub url: String,
    pub title: String,
    pub html: String,
    /// Probes answered with `loading` after each navigation before the
    /// model's own `ready_state` shows through.
    pub loading_probes: u32,
}

impl Default for PageModel {
    fn default() -> Self {
        Self {
            ready_state: "complete".to_string(),
            body_length: 4096,
            network_idle: true,
            has_error: false,
            content: None,
            url: "about:blank".to_string(),
            title: String::new(),
            html: "<html><head></head><body></body></html>".to_string(),
            loading_probes: 0,
        }
    }
}

/// How the page answers an evaluated script body.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptReply {
    /// Return this value.
    Value(Value),
    /// Throw with this message.
    Throw(String),
    /// Log this text between the sentinels instead of JSON.
    Malformed(String),
    /// Log nothing at all.
    Silent,
}

type Handler = Box<dyn Fn(&str) -> Option<ScriptReply> + Send + Sync>;

/// A console method: native, or a wrapper around another method.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SimMethod {
    id: u64,
    signature: Option<String>,
    original: Option<Box<SimMethod>>,
}

impl SimMethod {
    /// Innermost method of a wrapper chain.
    fn unwrapped(&self) -> &Self {
        let mut method = self;
        while let Some(inner) = &method.original {
            method = inner;
        }
        method
    }
}

#[derive(Debug, Clone, Default)]
struct SimCapture {
    initialized: bool,
    signature: Option<String>,
    buffer: Vec<ConsoleRecord>,
    originals: BTreeMap<String, SimMethod>,
}

#[derive(Default)]
struct PageState {
    model: PageModel,
    console: BTreeMap<String, SimMethod>,
    capture: Option<SimCapture>,
    next_id: u64,
    probes_since_navigation: u32,
    log_seq: u64,

    drains: u64,
    pending: Vec<(u64, ConsoleRecord)>,
    latency: VecDeque<u64>,
    drop_frames: u32,
    fail_installs: u32,
    failing_drains: u32,
    disconnected: bool,

    installs: u32,
    teardowns: u32,
    screenshots: u32,
    navigations: u32,
    commands: Vec<Command>,
}

impl PageState {
    fn fresh_console(&mut self) {
        self.console.clear();
        for level in ConsoleLevel::ALL {
            self.next_id += 1;
            self.console.insert(
                level.method().to_string(),
                SimMethod {
                    id: self.next_id,
                    signature: None,
                    original: None,
                },
            );
        }
    }

    fn timestamp(&mut self) -> String {
        self.log_seq += 1;
        let s = self.log_seq;
        format!(
            "2024-01-01T{:02}:{:02}:{:02}.000Z",
            (s / 3600) % 24,
            (s / 60) % 60,
            s % 60
        )
    }

    /// `console[level](text)` as the page would run it.
    fn console_call(&mut self, level: ConsoleLevel, text: &str, visible_at: u64) {
        let timestamp = self.timestamp();
        let record = ConsoleRecord::new(timestamp, level, text);

        let wrapped = self
            .console
            .get(level.method())
            .is_some_and(|m| m.signature.as_deref() == Some(CAPTURE_SIGNATURE));
        if wrapped {
            if let Some(capture) = self.capture.as_mut() {
                capture.buffer.push(record.clone());
                if capture.buffer.len() > CAPTURE_LIMIT {
                    let excess = capture.buffer.len() - CAPTURE_LIMIT;
                    capture.buffer.drain(..excess);
                }
            }
        }
        self.pending.push((visible_at, record));
    }

    fn probe_capture(&self) -> Value {
        let wrapped: serde_json::Map<String, Value> = ConsoleLevel::ALL
            .iter()
            .map(|level| {
                let method = self.console.get(level.method());
                (
                    level.method().to_string(),
                    json!({
                        "wrapped": method.is_some_and(|m| m.signature.as_deref() == Some(CAPTURE_SIGNATURE)),
                        "hasOriginal": method.is_some_and(|m| m.original.is_some()),
                    }),
                )
            })
            .collect();
        let capture = self.capture.as_ref();
        json!({
            "initialized": capture.is_some_and(|c| c.initialized),
            "hasBuffer": capture.is_some(),
            "hasOriginalMethods": capture.is_some_and(|c| !c.originals.is_empty()),
            "signature": capture.and_then(|c| c.signature.clone()),
            "wrapped": wrapped,
        })
    }

    fn teardown(&mut self) -> Value {
        self.teardowns += 1;
        let mut restored = 0;
        for level in ConsoleLevel::ALL {
            let name = level.method();
            let Some(current) = self.console.get(name).cloned() else {
                continue;
            };
            let target = if current.original.is_some() {
                Some(current.unwrapped().clone())
            } else {
                self.capture
                    .as_ref()
                    .and_then(|c| c.originals.get(name))
                    .cloned()
            };
            if let Some(target) = target {
                if target != current {
                    self.console.insert(name.to_string(), target);
                    restored += 1;
                }
            }
        }
        self.capture = None;
        json!({ "restored": restored })
    }

    fn install(&mut self) -> ScriptReply {
        if self.capture.is_some() {
            return ScriptReply::Throw("capture bookkeeping already present".to_string());
        }
        let failing = self.fail_installs > 0;
        if failing {
            self.fail_installs -= 1;
        }

        let mut capture = SimCapture {
            initialized: false,
            signature: Some(CAPTURE_SIGNATURE.to_string()),
            ..SimCapture::default()
        };
        for (i, level) in ConsoleLevel::ALL.iter().enumerate() {
            let name = level.method();
            if failing && i == 3 {
                // Script's catch block: restore what was wrapped, drop bookkeeping.
                for (level, original) in capture.originals {
                    self.console.insert(level, original);
                }
                return ScriptReply::Throw(format!("console.{name} is not a function"));
            }
            let Some(original) = self.console.get(name).cloned() else {
                continue;
            };
            capture.originals.insert(name.to_string(), original.clone());
            self.next_id += 1;
            self.console.insert(
                name.to_string(),
                SimMethod {
                    id: self.next_id,
                    signature: Some(CAPTURE_SIGNATURE.to_string()),
                    original: Some(Box::new(original)),
                },
            );
        }
        capture.initialized = true;
        self.capture = Some(capture);
        self.installs += 1;
        ScriptReply::Value(json!({ "installed": true }))
    }

    fn readiness(&mut self, body: &str) -> Value {
        let (selector, _error_selector) = probe_selectors(body).unwrap_or((None, String::new()));
        self.probes_since_navigation += 1;
        let ready_state = if self.probes_since_navigation <= self.model.loading_probes {
            "loading"
        } else {
            self.model.ready_state.as_str()
        };
        let content_check = selector.map(|selector| match &self.model.content {
            Some(content) if content.selector == selector => json!({
                "found": content.count > 0,
                "count": content.count,
                "visible": content.count > 0 && content.visible,
            }),
            _ => json!({ "found": false, "count": 0, "visible": false }),
        });
        json!({
            "readyState": ready_state,
            "url": self.model.url,
            "title": self.model.title,
            "bodyLength": self.model.body_length,
            "networkIdle": self.model.network_idle,
            "hasError": self.model.has_error,
            "contentCheck": content_check,
        })
    }

    fn navigate(&mut self, url: &str) {
        self.navigations += 1;
        self.model.url = url.to_string();
        self.probes_since_navigation = 0;
        self.capture = None;
        self.fresh_console();
    }
}

/// Reply for an untagged body when no handler claims it.
fn default_reply(body: &str, html: &str) -> ScriptReply {
    let body = body.trim();
    if body.contains("document.documentElement.outerHTML") {
        return ScriptReply::Value(Value::String(html.to_string()));
    }
    let expr = body
        .strip_prefix("return")
        .map_or(body, str::trim)
        .trim_end_matches(';')
        .trim();
    let expr = expr
        .strip_prefix('(')
        .and_then(|e| e.strip_suffix(')'))
        .unwrap_or(expr)
        .trim();
    if let Ok(value) = serde_json::from_str::<Value>(expr) {
        return ScriptReply::Value(value);
    }
    let terms: Option<Vec<i64>> = expr.split('+').map(|t| t.trim().parse().ok()).collect();
    if let Some(terms) = terms {
        return ScriptReply::Value(json!(terms.iter().sum::<i64>()));
    }
    ScriptReply::Throw(format!("{expr} is not defined"))
}

/// In-memory [`RemoteHost`] simulating one browser page.
pub struct ScriptedHost {
    handler: Option<Handler>,
    log: ConsoleStore,
    state: Mutex<PageState>,
}

impl ScriptedHost {
    /// Create a host showing `model`.
    #[must_use]
    pub fn new(model: PageModel) -> Self {
        let mut state = PageState {
            model,
            ..PageState::default()
        };
        state.fresh_console();
        Self {
            handler: None,
            log: ConsoleStore::new(),
            state: Mutex::new(state),
        }
    }

    /// Answer untagged script bodies with `handler` first.
    #[must_use]
    pub fn with_handler(
        mut self,
        handler: impl Fn(&str) -> Option<ScriptReply> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Extra drains before each successive script's output shows up.
    #[must_use]
    pub fn with_latency(self, latency: impl IntoIterator<Item = u64>) -> Self {
        self.lock().latency = latency.into_iter().collect();
        self
    }

    fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the next `count` framed scripts without logging their frames.
    pub fn drop_next_frames(&self, count: u32) {
        self.lock().drop_frames = count;
    }

    /// Make the next `count` install scripts throw part way through.
    pub fn fail_next_installs(&self, count: u32) {
        self.lock().fail_installs = count;
    }

    /// Make the next `count` drains fail transiently.
    pub fn fail_next_drains(&self, count: u32) {
        self.lock().failing_drains = count;
    }

    /// Lose the session for good.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// Leave wrappers from an older installer on every method, with no
    /// bookkeeping object.
    pub fn simulate_stale_wrappers(&self) {
        let mut state = self.lock();
        for level in ConsoleLevel::ALL {
            let name = level.method();
            let Some(current) = state.console.get(name).cloned() else {
                continue;
            };
            state.next_id += 1;
            let id = state.next_id;
            state.console.insert(
                name.to_string(),
                SimMethod {
                    id,
                    signature: Some("page-relay-capture/0".to_string()),
                    original: Some(Box::new(current)),
                },
            );
        }
    }

    /// Leave bookkeeping claiming an installation while the methods are native.
    pub fn simulate_orphaned_flag(&self) {
        let mut state = self.lock();
        let originals = state.console.clone();
        state.capture = Some(SimCapture {
            initialized: true,
            signature: Some(CAPTURE_SIGNATURE.to_string()),
            buffer: Vec::new(),
            originals,
        });
    }

    /// Identities of the console methods the current installation saved.
    #[must_use]
    pub fn original_method_ids(&self) -> Option<Vec<u64>> {
        self.lock()
            .capture
            .as_ref()
            .map(|c| c.originals.values().map(|m| m.id).collect())
    }

    /// Whether every console method is the page's native one.
    #[must_use]
    pub fn console_is_native(&self) -> bool {
        self.lock().console.values().all(|m| m.original.is_none())
    }

    /// Whether some method is wrapped while others are not.
    #[must_use]
    pub fn console_is_half_wrapped(&self) -> bool {
        let state = self.lock();
        let wrapped = state
            .console
            .values()
            .filter(|m| m.original.is_some())
            .count();
        wrapped > 0 && wrapped < state.console.len()
    }

    /// Texts currently in the capture buffer.
    #[must_use]
    pub fn captured_texts(&self) -> Vec<String> {
        self.lock()
            .capture
            .as_ref()
            .map(|c| c.buffer.iter().map(|r| r.text.clone()).collect())
            .unwrap_or_default()
    }

    /// Log a line from page code, as if the page itself called `console`.
    pub fn page_log(&self, level: ConsoleLevel, text: &str) {
        let mut state = self.lock();
        let visible_at = state.drains + 1;
        state.console_call(level, text, visible_at);
    }

    #[must_use]
    pub fn installs(&self) -> u32 {
        self.lock().installs
    }

    #[must_use]
    pub fn teardowns(&self) -> u32 {
        self.lock().teardowns
    }

    #[must_use]
    pub fn screenshots(&self) -> u32 {
        self.lock().screenshots
    }

    #[must_use]
    pub fn navigations(&self) -> u32 {
        self.lock().navigations
    }

    #[must_use]
    pub fn drains(&self) -> u64 {
        self.lock().drains
    }

    /// Every command issued so far.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    fn run_framed(&self, state: &mut PageState, framed: FramedScript<'_>) {
        let body = framed.body;
        let reply = match tag_of(body) {
            Some("capture-probe") => ScriptReply::Value(state.probe_capture()),
            Some("capture-teardown") => ScriptReply::Value(state.teardown()),
            Some("capture-install") => state.install(),
            Some("capture-verify") => {
                let token = verify_token(body).unwrap_or_default();
                let visible_at = state.drains + 1;
                state.console_call(ConsoleLevel::Log, &token, visible_at);
                let captured = state
                    .capture
                    .as_ref()
                    .is_some_and(|c| c.buffer.iter().any(|r| r.text == token));
                ScriptReply::Value(json!({ "captured": captured }))
            }
            Some("capture-read") => ScriptReply::Value(
                state
                    .capture
                    .as_ref()
                    .and_then(|c| serde_json::to_value(&c.buffer).ok())
                    .unwrap_or_else(|| json!([])),
            ),
            Some("readiness-probe") => ScriptReply::Value(state.readiness(body)),
            _ => self
                .handler
                .as_ref()
                .and_then(|handler| handler(body))
                .unwrap_or_else(|| default_reply(body, &state.model.html)),
        };

        if state.drop_frames > 0 {
            state.drop_frames -= 1;
            debug!(token = framed.token, "Dropping frame");
            return;
        }

        let payload = match reply {
            ScriptReply::Value(value) => value.to_string(),
            ScriptReply::Throw(message) => json!({ "error": message }).to_string(),
            ScriptReply::Malformed(text) => text,
            ScriptReply::Silent => return,
        };
        let marker = framed.marker();
        let delay = state.latency.pop_front().unwrap_or(0);
        let visible_at = state.drains + 1 + delay;
        state.console_call(ConsoleLevel::Log, marker.start(), visible_at);
        state.console_call(ConsoleLevel::Log, &payload, visible_at);
        state.console_call(ConsoleLevel::Log, marker.end(), visible_at);
    }
}

#[async_trait]
impl RemoteHost for ScriptedHost {
    async fn issue(&self, command: Command) -> Result<(), HostError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(HostError::Disconnected("browser session closed".into()));
        }
        match &command {
            Command::Navigate { url } => state.navigate(url),
            Command::RunScript { script } => {
                if let Some(framed) = FramedScript::parse(script) {
                    self.run_framed(&mut state, framed);
                } else if tag_of(script) == Some("capture-clear") {
                    if let Some(capture) = state.capture.as_mut() {
                        capture.buffer.clear();
                    }
                }
            }
            Command::Screenshot { .. } => state.screenshots += 1,
            Command::Wait { .. } | Command::Click { .. } | Command::DrainLog => {}
        }
        state.commands.push(command);
        Ok(())
    }

    async fn drain_log(&self) -> Result<String, HostError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(HostError::Disconnected("browser session closed".into()));
        }
        state.drains += 1;
        if state.failing_drains > 0 {
            state.failing_drains -= 1;
            return Err(HostError::Transport("console read timed out".into()));
        }
        let now = state.drains;
        let (ready, waiting): (Vec<_>, Vec<_>) =
            state.pending.drain(..).partition(|(at, _)| *at <= now);
        state.pending = waiting;
        for (_, record) in ready {
            self.log.push(record);
        }
        Ok(self.log.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reply_literals_and_sums() {
        assert_eq!(default_reply("return 1+1;", ""), ScriptReply::Value(json!(2)));
        assert_eq!(default_reply("return (\"hi\");", ""), ScriptReply::Value(json!("hi")));
        assert_eq!(
            default_reply("return document.documentElement.outerHTML;", "<html/>"),
            ScriptReply::Value(json!("<html/>"))
        );
        assert_eq!(
            default_reply("return missing;", ""),
            ScriptReply::Throw("missing is not defined".into())
        );
    }

    #[tokio::test]
    async fn test_page_log_reaches_host_log() {
        let host = ScriptedHost::new(PageModel::default());
        host.page_log(ConsoleLevel::Warn, "deprecated API");
        assert_eq!(host.drain_log().await.unwrap(), "deprecated API");
        // Nothing wrapped, nothing captured.
        assert!(host.captured_texts().is_empty());
    }

    #[tokio::test]
    async fn test_navigation_resets_console() {
        let host = ScriptedHost::new(PageModel::default());
        host.simulate_stale_wrappers();
        assert!(!host.console_is_native());

        host.issue(Command::navigate("https://example.edu"))
            .await
            .unwrap();
        assert!(host.console_is_native());
        assert_eq!(host.navigations(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_fatal() {
        let host = ScriptedHost::new(PageModel::default());
        host.disconnect();
        assert!(matches!(
            host.drain_log().await,
            Err(HostError::Disconnected(_))
        ));
    }
}
