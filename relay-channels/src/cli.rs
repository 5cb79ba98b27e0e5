//! CLI channel adapter for interactive terminal sessions.
//!
//! Every line typed is a reply in one local thread, so a terminal conversation
//! keeps resuming the same assistant session. `/new` starts a fresh thread and
//! `/quit` (or `/exit`) ends input.

use crate::message::{ChannelMessage, ChannelType, MessageKind, OutgoingMessage};
use crate::traits::{Channel, ChannelResult};
use async_trait::async_trait;
use relay_common::logging::generate_trace_id;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Channel id used for all local threads.
pub const CLI_CHANNEL_ID: &str = "cli";

/// CLI channel - stdin/stdout, always available.
pub struct CliChannel;

impl CliChannel {
    /// Create a new CLI channel.
    pub const fn new() -> Self {
        Self
    }

    /// Forward lines from `reader` as messages until EOF or `/quit`.
    pub async fn read_lines<R>(&self, reader: R, tx: &mpsc::Sender<ChannelMessage>) -> ChannelResult<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut root = new_thread_root();

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            match line {
                "" => continue,
                "/quit" | "/exit" => break,
                "/new" => {
                    root = new_thread_root();
                    println!("(new conversation)");
                    continue;
                }
                _ => {}
            }

            let msg = ChannelMessage {
                id: uuid::Uuid::new_v4().to_string(),
                channel_type: ChannelType::Cli,
                channel_id: CLI_CHANNEL_ID.to_string(),
                thread_id: Some(root.clone()),
                user_id: "user".to_string(),
                text: line.to_string(),
                kind: MessageKind::Local,
                timestamp: chrono::Utc::now().timestamp_millis(),
                trace_id: generate_trace_id(),
            };

            if tx.send(msg).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn new_thread_root() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String> {
        println!("{}\n", message.text());
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn listen(&self, tx: mpsc::Sender<ChannelMessage>) -> ChannelResult<()> {
        self.read_lines(BufReader::new(io::stdin()), &tx).await
    }

    async fn health_check(&self) -> ChannelResult<()> {
        Ok(())
    }
}
