//! Relay Channels - keeps chat threads attached to coding assistant sessions.
//!
//! Each chat thread is bound to one assistant session. The first message in a
//! thread starts a session; every later reply in that thread resumes it, even
//! across relay restarts, because the thread → session mapping is persisted.
//!
//! ## Architecture
//!
//! ```text
//! Slack / CLI → Channel::listen → ThreadDispatcher → Router → Assistant (claude -p)
//!                                  (one worker         ↓
//!                                   per thread)    SessionStore (sessions.json)
//!                                                      ↓
//! User ←────────────── Channel::send ←──────────── reply in thread
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod assistant;
pub mod cli;
pub mod dispatch;
pub mod message;
pub mod router;
pub mod session;
pub mod slack;
pub mod traits;

// Re-export commonly used types
pub use assistant::{Assistant, AssistantReply, ClaudeCli, InvokeError, InvokeRequest};
pub use cli::CliChannel;
pub use dispatch::ThreadDispatcher;
pub use message::{
    ChannelMessage, ChannelType, MessageKind, OutgoingContent, OutgoingMessage, ThreadKey,
};
pub use router::{Route, Router};
pub use session::{
    JsonFileBackend, MemoryBackend, SessionBackend, SessionMap, SessionRecord, SessionStore,
    StoreError,
};
pub use slack::SlackChannel;
pub use traits::{Channel, ChannelError, ChannelResult, MessageHandler};

use anyhow::Context;
use relay_common::config::Config;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of the inbound message queue between a channel and the dispatcher.
const INBOUND_QUEUE: usize = 100;

/// Which chat surface the relay listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ChannelKind {
    /// Slack via Socket Mode
    Slack,
    /// Local terminal
    Cli,
}

/// Open the persisted session store described by `config`.
pub fn open_store(config: &Config) -> anyhow::Result<SessionStore> {
    let path = config.sessions.path();
    let backend = JsonFileBackend::open(&path)
        .with_context(|| format!("Failed to open session file {}", path.display()))?;
    let store = SessionStore::load(Arc::new(backend), config.sessions.on_corrupt)?
        .with_write_timeout(config.sessions.write_timeout());
    Ok(store)
}

/// Run the relay until the channel stops or Ctrl-C is pressed.
pub async fn run(config: &Config, kind: ChannelKind) -> anyhow::Result<()> {
    let store = Arc::new(open_store(config)?);

    let channel: Arc<dyn Channel> = match kind {
        ChannelKind::Slack => Arc::new(SlackChannel::from_config(&config.slack)),
        ChannelKind::Cli => Arc::new(CliChannel::new()),
    };

    match channel.health_check().await {
        Ok(()) => {}
        Err(e @ ChannelError::Auth(_)) => {
            return Err(e).with_context(|| format!("{} credentials rejected", channel.name()))
        }
        Err(e) => tracing::warn!(channel = channel.name(), error = %e, "Health check failed, continuing"),
    }

    let working_dir = config.assistant.working_dir();
    let assistant = Arc::new(ClaudeCli::from_config(&config.assistant));
    let router = Arc::new(Router::new(
        store.clone(),
        assistant,
        channel.clone(),
        working_dir.clone(),
    ));
    let dispatcher = Arc::new(ThreadDispatcher::new(router));

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let processor = ThreadDispatcher::spawn_processor(dispatcher.clone(), rx);

    tracing::info!(
        channel = channel.name(),
        sessions = store.len(),
        store = %store.location(),
        working_dir = %working_dir.display(),
        "Relay started"
    );

    let interrupted = tokio::select! {
        result = channel.listen(tx) => {
            result.with_context(|| format!("{} channel stopped", channel.name()))?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
            true
        }
    };

    processor.await.context("Dispatcher task failed")?;

    // Input ended normally: let queued conversations finish unless interrupted.
    if !interrupted {
        tokio::select! {
            () = drained(&dispatcher) => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
        }
    }

    let pending = dispatcher.active_threads();
    if pending > 0 {
        tracing::warn!(threads = pending, "Exiting with conversations still in flight");
    }

    Ok(())
}

async fn drained<H: MessageHandler>(dispatcher: &ThreadDispatcher<H>) {
    while dispatcher.active_threads() > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
