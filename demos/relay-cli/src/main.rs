//! Drive a page through an executor speaking the tag dialect on stdio.
//!
//! Run with: cargo run -p relay-cli -- <url> [content-selector] [script]
//!
//! Commands are written to stdout and one JSON reply per line is read from
//! stdin, so the executor is expected to sit on the other end of a pipe.
//! Logs go to stderr. Relay settings can be overridden with a JSON object
//! in `PAGE_RELAY_CONFIG`.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, bail};
use page_relay_core::{Payload, RelayConfig, WaitOptions};
use page_relay_session::PageSession;
use page_relay_transport::StdioHost;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SCRIPT: &str = "return { title: document.title, links: document.links.length };";

fn load_config() -> anyhow::Result<RelayConfig> {
    match std::env::var("PAGE_RELAY_CONFIG") {
        Ok(json) => RelayConfig::from_json(&json).context("invalid PAGE_RELAY_CONFIG"),
        Err(_) => Ok(RelayConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        bail!("usage: relay-cli <url> [content-selector] [script]");
    };
    let selector = args.next().filter(|s| !s.is_empty());
    let script = args.next().unwrap_or_else(|| DEFAULT_SCRIPT.to_string());

    let host = Arc::new(StdioHost::new(tokio::io::stdout(), tokio::io::stdin()));
    let session = PageSession::with_tokio_clock(host, load_config()?)?;

    session.navigate(&url).await?;

    let mut options = WaitOptions::new(Duration::from_secs(30), Duration::from_secs(2));
    if let Some(selector) = selector {
        options = options.with_content_selector(selector);
    }
    let outcome = session.wait_until_ready(&options).await?;
    if !outcome.is_ready() {
        let errors = outcome
            .last_state()
            .map(|state| state.errors.join("; "))
            .unwrap_or_default();
        warn!(state = ?outcome.poll_state(), %errors, "Page not ready, continuing anyway");
    }

    let report = session.ensure_capture().await?;
    info!(
        initialized = report.initialized,
        reinstalled = report.reinstalled,
        "Console capture checked"
    );

    let result = session.evaluate(&script).await?;
    info!(
        attempts = result.attempts,
        found_markers = result.found_markers,
        "Script evaluated"
    );
    match result.payload {
        Payload::Parsed(value) => eprintln!("{}", serde_json::to_string_pretty(&value)?),
        Payload::Raw(text) => eprintln!("{text}"),
        Payload::Error(message) => bail!("page script threw: {message}"),
        Payload::Absent => bail!(
            "no result after {} attempts; last log text: {}",
            result.attempts,
            result.raw_text
        ),
    }

    if let Some(records) = session.console_records().await? {
        for record in records {
            eprintln!("[{:?}] {}", record.level, record.text);
        }
    }
    Ok(())
}
