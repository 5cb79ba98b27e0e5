//! Conversation router.
//!
//! Handles the complete message flow for one inbound message:
//! 1. Classify it as starting a new assistant session or continuing the
//!    thread's existing one
//! 2. Run the assistant, resuming the stored session when continuing
//! 3. Record the session id the assistant returned for the thread
//! 4. Post the answer (or a failure notice) back into the same thread

use crate::assistant::{Assistant, AssistantReply, InvokeError, InvokeRequest};
use crate::message::{ChannelMessage, OutgoingContent, OutgoingMessage, ThreadKey};
use crate::session::{SessionRecord, SessionStore};
use crate::traits::{Channel, MessageHandler};
use async_trait::async_trait;
use relay_common::util::fenced;
use std::path::PathBuf;
use std::sync::Arc;

/// Prompt used when a new conversation carries no text of its own.
pub const DEFAULT_PROMPT: &str = "Hello";

/// How an inbound message relates to the assistant session of its thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// No session is known for the thread yet
    Start,
    /// Resume the thread's recorded session
    Continue(SessionRecord),
}

/// Routes inbound messages to the assistant and replies in-thread.
pub struct Router {
    store: Arc<SessionStore>,
    assistant: Arc<dyn Assistant>,
    channel: Arc<dyn Channel>,
    working_dir: PathBuf,
}

impl Router {
    /// Create a new router.
    pub fn new(
        store: Arc<SessionStore>,
        assistant: Arc<dyn Assistant>,
        channel: Arc<dyn Channel>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            assistant,
            channel,
            working_dir: working_dir.into(),
        }
    }

    /// Decide whether `message` starts or continues a session.
    ///
    /// Only replies inside a thread can continue; a top-level message always
    /// opens a new thread.
    pub fn classify(&self, message: &ChannelMessage) -> Route {
        if !message.is_thread_reply() {
            return Route::Start;
        }
        match self.store.get(&message.thread_key()) {
            Some(record) => Route::Continue(record),
            None => Route::Start,
        }
    }

    /// Run the assistant for `message` and build the reply to post.
    ///
    /// Returns `None` when the message needs no reply.
    pub async fn respond(&self, message: &ChannelMessage) -> Option<OutgoingContent> {
        let key = message.thread_key();
        let route = self.classify(message);
        let prompt = message.text.trim();

        let request = match &route {
            Route::Continue(_) if prompt.is_empty() => {
                tracing::debug!(thread_key = %key, "Ignoring empty follow-up");
                return None;
            }
            Route::Continue(record) => InvokeRequest {
                prompt: prompt.to_string(),
                resume_session_id: Some(record.session_id.clone()),
                working_dir: record.cwd.clone().unwrap_or_else(|| self.working_dir.clone()),
            },
            Route::Start => InvokeRequest {
                prompt: if prompt.is_empty() { DEFAULT_PROMPT } else { prompt }.to_string(),
                resume_session_id: None,
                working_dir: self.working_dir.clone(),
            },
        };

        tracing::info!(
            thread_key = %key,
            trace_id = %message.trace_id,
            session_id = request.resume_session_id.as_deref().unwrap_or(""),
            resume = request.resume_session_id.is_some(),
            "Routing message to assistant"
        );

        let working_dir = request.working_dir.clone();
        match self.assistant.invoke(request).await {
            Ok(reply) => Some(self.record(&key, message, reply, working_dir).await),
            Err(e) => Some(Self::failure_notice(&key, message, &route, &e)),
        }
    }

    async fn record(
        &self,
        key: &ThreadKey,
        message: &ChannelMessage,
        reply: AssistantReply,
        working_dir: PathBuf,
    ) -> OutgoingContent {
        let record = SessionRecord::new(reply.session_id.clone(), Some(working_dir));
        if let Err(e) = self.store.put(key.clone(), record).await {
            tracing::error!(
                thread_key = %key,
                trace_id = %message.trace_id,
                session_id = %reply.session_id,
                error = %e,
                "Failed to save session state"
            );
            return OutgoingContent::Text {
                text: format!("Failed to save session state:\n{}", fenced(&e.to_string())),
            };
        }

        tracing::info!(
            thread_key = %key,
            trace_id = %message.trace_id,
            session_id = %reply.session_id,
            response_len = reply.text.len(),
            "Assistant replied"
        );
        OutgoingContent::Markdown { text: reply.text }
    }

    fn failure_notice(
        key: &ThreadKey,
        message: &ChannelMessage,
        route: &Route,
        error: &InvokeError,
    ) -> OutgoingContent {
        tracing::error!(
            thread_key = %key,
            trace_id = %message.trace_id,
            error = %error,
            "Assistant invocation failed"
        );

        let text = match (error, route) {
            (InvokeError::Reported(text), _) => {
                format!("Assistant returned an error:\n{}", fenced(text))
            }
            (_, Route::Start) => {
                format!("Failed to start assistant session:\n{}", fenced(&error.to_string()))
            }
            (_, Route::Continue(_)) => {
                format!("Sorry, I encountered an error:\n{}", fenced(&error.to_string()))
            }
        };
        OutgoingContent::Text { text }
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle(&self, message: ChannelMessage) {
        let Some(content) = self.respond(&message).await else {
            return;
        };

        let outgoing = OutgoingMessage::reply_to(&message, content);
        if let Err(e) = self.channel.send(outgoing).await {
            tracing::error!(
                thread_key = %message.thread_key(),
                trace_id = %message.trace_id,
                channel = self.channel.name(),
                error = %e,
                "Failed to send reply"
            );
        }
    }
}
