//! External coding assistant invocation.
//!
//! Each invocation runs the assistant CLI once, in the thread's working
//! directory, and captures its final JSON result. Passing a prior session id
//! makes the assistant resume that session's context.

use async_trait::async_trait;
use relay_common::config::AssistantConfig;
use relay_common::util::truncate_with_ellipsis;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;

/// One prompt for the assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeRequest {
    /// Prompt text
    pub prompt: String,
    /// Session to resume; `None` starts a fresh session
    pub resume_session_id: Option<String>,
    /// Directory the assistant runs in
    pub working_dir: PathBuf,
}

/// The assistant's complete answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantReply {
    /// Final response text
    pub text: String,
    /// Session id to resume next time
    pub session_id: String,
}

/// Assistant invocation error type.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Failed to start assistant `{binary}`: {reason}")]
    Spawn { binary: String, reason: String },

    #[error("Assistant timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Assistant exited with code {}: {stderr}", .code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("{0}")]
    Reported(String),

    #[error("Unexpected assistant output: {0}")]
    MalformedOutput(String),
}

impl InvokeError {
    /// Whether the assistant itself reported the failure (as opposed to the
    /// process failing).
    pub const fn is_reported(&self) -> bool {
        matches!(self, Self::Reported(_))
    }
}

/// Something that can answer prompts within a resumable session.
#[async_trait]
pub trait Assistant: Send + Sync + 'static {
    /// Run one prompt to completion.
    async fn invoke(&self, request: InvokeRequest) -> Result<AssistantReply, InvokeError>;
}

/// Result object printed by `claude -p ... --output-format json`.
#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    is_error: bool,
}

/// Assistant backed by the `claude` command-line program.
pub struct ClaudeCli {
    binary: String,
    skip_permissions: bool,
    extra_args: Vec<String>,
    strip_env: Vec<String>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ClaudeCli {
    /// Create an invoker for `binary` with default settings.
    pub fn new(binary: impl Into<String>) -> Self {
        Self::from_config(&AssistantConfig {
            binary: binary.into(),
            ..AssistantConfig::default()
        })
    }

    /// Create an invoker from configuration.
    pub fn from_config(config: &AssistantConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            skip_permissions: config.skip_permissions,
            extra_args: config.extra_args.clone(),
            strip_env: config.strip_env.clone(),
            timeout: config.timeout(),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        }
    }

    /// Set the invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command-line arguments for one invocation.
    fn build_args(&self, request: &InvokeRequest) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(session_id) = &request.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push("-p".to_string());
        args.push(request.prompt.clone());
        args.push("--output-format".to_string());
        args.push("json".to_string());
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Turn captured stdout into a reply.
    fn parse_output(stdout: &str) -> Result<AssistantReply, InvokeError> {
        let raw = stdout.trim();
        if raw.is_empty() {
            return Err(InvokeError::MalformedOutput("empty output".into()));
        }

        let parsed: CliResult = serde_json::from_str(raw).map_err(|e| {
            InvokeError::MalformedOutput(format!(
                "{e}; raw output: {}",
                truncate_with_ellipsis(raw, 500)
            ))
        })?;

        if parsed.is_error {
            return Err(InvokeError::Reported(parsed.result));
        }

        if parsed.session_id.trim().is_empty() {
            return Err(InvokeError::MalformedOutput("no session_id in output".into()));
        }

        Ok(AssistantReply {
            text: parsed.result,
            session_id: parsed.session_id,
        })
    }
}

#[async_trait]
impl Assistant for ClaudeCli {
    async fn invoke(&self, request: InvokeRequest) -> Result<AssistantReply, InvokeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| InvokeError::Spawn {
                binary: self.binary.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            session = request.resume_session_id.as_deref().unwrap_or("new"),
            cwd = %request.working_dir.display(),
            "Running assistant"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.build_args(&request))
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.strip_env {
            cmd.env_remove(key);
        }

        let child = cmd.spawn().map_err(|e| InvokeError::Spawn {
            binary: self.binary.clone(),
            reason: e.to_string(),
        })?;

        // Dropping the output future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(InvokeError::MalformedOutput(format!(
                    "failed to collect output: {e}"
                )))
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "Assistant timed out");
                return Err(InvokeError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            return Err(InvokeError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Self::parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}
