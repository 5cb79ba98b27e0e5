//! Slack channel.
//!
//! Receives events over Socket Mode (an outbound WebSocket, so no public
//! endpoint is needed) and replies through the Web API into the originating
//! thread.

pub mod format;

use crate::message::{ChannelMessage, ChannelType, MessageKind, OutgoingContent, OutgoingMessage};
use crate::traits::{Channel, ChannelError, ChannelResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use relay_common::config::SlackConfig;
use relay_common::logging::generate_trace_id;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const SLACK_API: &str = "https://slack.com/api";

/// Leading bot mention, e.g. `<@U0123ABC>` or `<@U0123ABC|relay>`.
static LEADING_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*<@[A-Za-z0-9]+(\|[^>]*)?>\s*").unwrap());

/// Why a Socket Mode connection ended without error.
#[derive(Debug, PartialEq, Eq)]
enum ConnectionEnd {
    /// Slack asked us to reconnect, or the socket closed
    Reconnect,
    /// Nobody is consuming messages anymore
    ReceiverClosed,
}

/// Slack channel using Socket Mode and the Web API.
pub struct SlackChannel {
    bot_token: String,
    app_token: String,
    allowed_users: Vec<String>,
    reconnect_max: Duration,
    api_base: String,
    client: Client,
}

impl SlackChannel {
    /// Create a new Slack channel.
    pub fn new(bot_token: String, app_token: String, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            app_token,
            allowed_users,
            reconnect_max: Duration::from_secs(60),
            api_base: SLACK_API.to_string(),
            client: Client::new(),
        }
    }

    /// Create a Slack channel from configuration.
    pub fn from_config(config: &SlackConfig) -> Self {
        let mut channel = Self::new(
            config.bot_token.clone(),
            config.app_token.clone(),
            config.allowed_users.clone(),
        );
        channel.reconnect_max = Duration::from_secs(config.reconnect_max_secs.max(1));
        channel
    }

    /// Point Web API calls at another base URL.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn is_user_allowed(&self, user_id: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == "*" || u == user_id)
    }

    /// Call a Web API method and return the response body when `ok`.
    async fn call(&self, method: &str, token: &str, body: Option<&Value>) -> ChannelResult<Value> {
        let mut request = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Slack {method} request failed: {e}")))?;

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Internal(format!("Failed to parse {method} response: {e}")))?;

        if data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(data);
        }

        let error = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        Err(match error {
            "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" | "not_allowed_token_type" => {
                ChannelError::Auth(format!("Slack {method} failed: {error}"))
            }
            _ => ChannelError::SendFailed(format!("Slack {method} failed: {error}")),
        })
    }

    /// Ask Slack for a fresh Socket Mode WebSocket URL.
    async fn open_connection(&self) -> ChannelResult<String> {
        let data = self
            .call("apps.connections.open", &self.app_token, None)
            .await
            .map_err(|e| match e {
                ChannelError::Auth(_) => e,
                other => ChannelError::Connection(other.to_string()),
            })?;

        data.get("url")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| ChannelError::Connection("apps.connections.open returned no url".into()))
    }

    /// Run one Socket Mode connection until it ends.
    async fn run_connection(&self, tx: &mpsc::Sender<ChannelMessage>) -> ChannelResult<ConnectionEnd> {
        let url = self.open_connection().await?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connection(format!("WebSocket connection failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(ChannelError::Connection(format!("WebSocket error: {e}"))),
            };

            let envelope: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "Slack: ignoring unparsable frame");
                    continue;
                }
            };

            // Slack redelivers anything not acknowledged within three seconds.
            if let Some(envelope_id) = envelope.get("envelope_id").and_then(Value::as_str) {
                write
                    .send(Message::Text(ack(envelope_id)))
                    .await
                    .map_err(|e| ChannelError::Connection(format!("Failed to acknowledge: {e}")))?;
            }

            match envelope.get("type").and_then(Value::as_str).unwrap_or("") {
                "hello" => tracing::info!("Slack: socket connected"),
                "disconnect" => {
                    let reason = envelope
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    tracing::info!(reason, "Slack: server requested reconnect");
                    return Ok(ConnectionEnd::Reconnect);
                }
                "events_api" => {
                    let Some(message) = envelope.pointer("/payload/event").and_then(parse_event)
                    else {
                        continue;
                    };

                    if !self.is_user_allowed(&message.user_id) {
                        tracing::warn!(user = %message.user_id, "Slack: ignoring message from unauthorized user");
                        continue;
                    }

                    tracing::debug!(
                        channel_id = %message.channel_id,
                        thread_key = %message.thread_key(),
                        trace_id = %message.trace_id,
                        "Slack: received message"
                    );

                    if tx.send(message).await.is_err() {
                        return Ok(ConnectionEnd::ReceiverClosed);
                    }
                }
                other => tracing::debug!(envelope_type = other, "Slack: ignoring envelope"),
            }
        }

        Ok(ConnectionEnd::Reconnect)
    }
}

/// Acknowledgement frame for a Socket Mode envelope.
fn ack(envelope_id: &str) -> String {
    json!({ "envelope_id": envelope_id }).to_string()
}

/// Remove a leading bot mention and surrounding whitespace.
pub fn strip_mention(text: &str) -> String {
    LEADING_MENTION.replace(text, "").trim().to_string()
}

/// Convert a Slack event into a channel message.
///
/// Accepts `app_mention` events and direct messages from users. Bot
/// messages, edits and other subtypes are skipped.
pub fn parse_event(event: &Value) -> Option<ChannelMessage> {
    let str_field = |name: &str| event.get(name).and_then(Value::as_str);

    let kind = match str_field("type")? {
        "app_mention" => MessageKind::Mention,
        "message" if str_field("channel_type") == Some("im") => MessageKind::DirectMessage,
        _ => return None,
    };

    if event.get("bot_id").is_some() || event.get("subtype").is_some() {
        return None;
    }

    let ts = str_field("ts")?;
    // A thread's parent carries its own ts as thread_ts.
    let thread_id = str_field("thread_ts")
        .filter(|thread_ts| *thread_ts != ts)
        .map(String::from);

    let timestamp = ts
        .parse::<f64>()
        .map(|secs| (secs * 1000.0) as i64)
        .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis());

    Some(ChannelMessage {
        id: ts.to_string(),
        channel_type: ChannelType::Slack,
        channel_id: str_field("channel")?.to_string(),
        thread_id,
        user_id: str_field("user")?.to_string(),
        text: strip_mention(str_field("text").unwrap_or("")),
        kind,
        timestamp,
        trace_id: generate_trace_id(),
    })
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String> {
        let text = match &message.content {
            OutgoingContent::Text { text } => text.clone(),
            OutgoingContent::Markdown { text } => format::convert_to_slack_mrkdwn(text),
        };
        let text = if text.trim().is_empty() {
            "_(empty response)_".to_string()
        } else {
            text
        };

        let mut first_ts = None;
        for chunk in format::split_message(&text, format::MAX_CHUNK_CHARS) {
            let mut body = json!({
                "channel": message.channel_id,
                "text": chunk,
            });
            if let Some(thread_ts) = &message.thread_id {
                body["thread_ts"] = json!(thread_ts);
            }

            let data = self.call("chat.postMessage", &self.bot_token, Some(&body)).await?;
            if first_ts.is_none() {
                first_ts = data.get("ts").and_then(Value::as_str).map(String::from);
            }
        }

        Ok(first_ts.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn listen(&self, tx: mpsc::Sender<ChannelMessage>) -> ChannelResult<()> {
        let initial_backoff = Duration::from_secs(1);
        let mut backoff = initial_backoff;

        tracing::info!("Slack channel listening via Socket Mode...");

        loop {
            match self.run_connection(&tx).await {
                Ok(ConnectionEnd::ReceiverClosed) => {
                    tracing::info!("Slack: receiver closed, stopping");
                    return Ok(());
                }
                Ok(ConnectionEnd::Reconnect) => {
                    backoff = initial_backoff;
                }
                Err(e @ ChannelError::Auth(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, retry_in_secs = backoff.as_secs(), "Slack: connection lost");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.reconnect_max);
                }
            }

            if tx.is_closed() {
                return Ok(());
            }
        }
    }

    async fn health_check(&self) -> ChannelResult<()> {
        self.call("auth.test", &self.bot_token, None)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                ChannelError::Auth(_) => e,
                other => ChannelError::Connection(format!("Health check failed: {other}")),
            })
    }
}
