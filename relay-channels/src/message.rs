//! Message types for channel communication.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel type enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Slack,
    Cli,
}

impl ChannelType {
    /// Get the channel type as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Cli => "cli",
        }
    }
}

/// How the message reached the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// The bot was @-mentioned in a channel
    Mention,
    /// Direct message to the bot
    DirectMessage,
    /// Local terminal input
    Local,
}

/// Stable identifier of a conversation thread.
///
/// Derived from the platform channel id and the id of the message that roots
/// the thread, so every reply in a thread resolves to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadKey(String);

impl ThreadKey {
    /// Build a key from a channel id and a thread-root message id.
    pub fn new(channel_id: &str, root_id: &str) -> Self {
        Self(format!("{channel_id}:{root_id}"))
    }

    /// The key as persisted.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unified inbound message format for all channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Message ID (channel-specific, e.g. Slack `ts`)
    pub id: String,
    /// Channel type
    pub channel_type: ChannelType,
    /// Channel-specific identifier (Slack channel / DM id)
    pub channel_id: String,
    /// Root message id of the thread this message replies in, if any
    #[serde(default)]
    pub thread_id: Option<String>,
    /// User identifier
    pub user_id: String,
    /// Message text with any leading bot mention removed
    pub text: String,
    /// How the message reached the relay
    pub kind: MessageKind,
    /// Timestamp (Unix millis)
    pub timestamp: i64,
    /// Trace ID for log correlation
    #[serde(default)]
    pub trace_id: String,
}

impl ChannelMessage {
    /// Id of the message rooting this message's thread.
    ///
    /// A top-level message roots a new thread.
    pub fn thread_root(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.id)
    }

    /// Thread key this message belongs to.
    pub fn thread_key(&self) -> ThreadKey {
        ThreadKey::new(&self.channel_id, self.thread_root())
    }

    /// Whether this message was posted as a reply inside an existing thread.
    pub fn is_thread_reply(&self) -> bool {
        self.thread_id.is_some()
    }

    /// Get the channel type as a string.
    pub fn channel_type_str(&self) -> &'static str {
        self.channel_type.as_str()
    }
}

/// Outgoing message to send to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Target channel ID
    pub channel_id: String,
    /// Root message id of the thread to reply in
    pub thread_id: Option<String>,
    /// Message content
    pub content: OutgoingContent,
}

impl OutgoingMessage {
    /// Build a reply into the thread of `message`.
    pub fn reply_to(message: &ChannelMessage, content: OutgoingContent) -> Self {
        Self {
            channel_id: message.channel_id.clone(),
            thread_id: Some(message.thread_root().to_string()),
            content,
        }
    }

    /// Text of the message, regardless of formatting.
    pub fn text(&self) -> &str {
        match &self.content {
            OutgoingContent::Text { text } | OutgoingContent::Markdown { text } => text,
        }
    }
}

/// Outgoing message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutgoingContent {
    /// Plain text, posted verbatim
    Text { text: String },
    /// Markdown text, converted to the platform's format
    Markdown { text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, thread_id: Option<&str>) -> ChannelMessage {
        ChannelMessage {
            id: id.into(),
            channel_type: ChannelType::Slack,
            channel_id: "C1".into(),
            thread_id: thread_id.map(String::from),
            user_id: "U1".into(),
            text: "hi".into(),
            kind: MessageKind::Mention,
            timestamp: 0,
            trace_id: "trace".into(),
        }
    }

    #[test]
    fn top_level_message_roots_its_own_thread() {
        let msg = message("1700.0001", None);
        assert_eq!(msg.thread_root(), "1700.0001");
        assert_eq!(msg.thread_key().as_str(), "C1:1700.0001");
        assert!(!msg.is_thread_reply());
    }

    #[test]
    fn reply_resolves_to_thread_root() {
        let root = message("1700.0001", None);
        let reply = message("1700.0009", Some("1700.0001"));
        assert_eq!(reply.thread_key(), root.thread_key());
        assert!(reply.is_thread_reply());
    }

    #[test]
    fn same_root_in_different_channels_differs() {
        assert_ne!(ThreadKey::new("C1", "1"), ThreadKey::new("C2", "1"));
    }

    #[test]
    fn reply_targets_thread_root() {
        let reply = message("1700.0009", Some("1700.0001"));
        let out = OutgoingMessage::reply_to(
            &reply,
            OutgoingContent::Text { text: "ok".into() },
        );
        assert_eq!(out.channel_id, "C1");
        assert_eq!(out.thread_id.as_deref(), Some("1700.0001"));
        assert_eq!(out.text(), "ok");
    }

    #[test]
    fn thread_key_serializes_as_string() {
        let key = ThreadKey::new("C1", "1700.0001");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"C1:1700.0001\"");
    }
}
