//! Channel traits for implementing channel adapters.

use crate::message::{ChannelMessage, OutgoingMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Channel not ready")]
    NotReady,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Channel adapter trait.
///
/// A channel delivers inbound messages and accepts replies scoped to a thread.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &'static str;

    /// Post a message, returning the platform message id.
    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String>;

    /// Listen for incoming messages and forward them to `tx`.
    ///
    /// Returns when the channel is closed or the receiver is dropped.
    async fn listen(&self, tx: mpsc::Sender<ChannelMessage>) -> ChannelResult<()>;

    /// Check if the channel is healthy.
    async fn health_check(&self) -> ChannelResult<()>;
}

/// Handler for processing one inbound message end to end.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message.
    async fn handle(&self, message: ChannelMessage);
}
