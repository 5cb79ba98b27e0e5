//! Configuration management for the thread relay.
//!
//! The relay reads a single configuration file at `~/.relay/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Command-line flags (applied by the binary)
//! 2. Environment variables
//! 3. Explicit config file values
//! 4. Default values
//!
//! # Environment Variable Mapping
//!
//! - `SLACK_BOT_TOKEN` → slack.bot_token
//! - `SLACK_APP_TOKEN` → slack.app_token
//! - `SESSIONS_FILE` → sessions.path
//! - `RELAY_ASSISTANT_BIN` → assistant.binary
//! - `RELAY_WORKING_DIR` → assistant.working_dir
//! - `RELAY_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::expand_path;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".relay"),
        |dirs| dirs.home_dir().join(".relay"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Slack Socket Mode channel
    #[serde(default)]
    pub slack: SlackConfig,

    /// External assistant process
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Thread → session persistence
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("SLACK_BOT_TOKEN") {
            self.slack.bot_token = token;
        }
        if let Ok(token) = std::env::var("SLACK_APP_TOKEN") {
            self.slack.app_token = token;
        }

        if let Ok(path) = std::env::var("SESSIONS_FILE") {
            self.sessions.path = Some(path);
        }

        if let Ok(bin) = std::env::var("RELAY_ASSISTANT_BIN") {
            self.assistant.binary = bin;
        }
        if let Ok(dir) = std::env::var("RELAY_WORKING_DIR") {
            self.assistant.working_dir = Some(dir);
        }

        if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }
}

/// Slack channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    /// Bot token (`xoxb-...`) used for the Web API
    #[serde(default)]
    pub bot_token: String,

    /// App-level token (`xapp-...`) used to open Socket Mode connections
    #[serde(default)]
    pub app_token: String,

    /// Users allowed to talk to the assistant. Empty or `*` means everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,

    /// Upper bound on the reconnect backoff, in seconds
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            app_token: String::new(),
            allowed_users: Vec::new(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

/// External assistant process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Binary name or path of the assistant CLI
    #[serde(default = "default_assistant_binary")]
    pub binary: String,

    /// Upper bound on a single invocation, in seconds
    #[serde(default = "default_assistant_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of assistant processes running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Pass `--dangerously-skip-permissions` to the assistant.
    ///
    /// This grants the assistant full file system and shell access inside
    /// its working directory.
    #[serde(default = "default_true")]
    pub skip_permissions: bool,

    /// Extra arguments appended to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Environment variables removed from the child environment
    #[serde(default = "default_strip_env")]
    pub strip_env: Vec<String>,

    /// Working directory for new sessions (defaults to the process cwd)
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: default_assistant_binary(),
            timeout_secs: default_assistant_timeout(),
            max_concurrent: default_max_concurrent(),
            skip_permissions: true,
            extra_args: Vec::new(),
            strip_env: default_strip_env(),
            working_dir: None,
        }
    }
}

impl AssistantConfig {
    /// Invocation timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the working directory for new sessions.
    pub fn working_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) => expand_path(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// What to do when the persisted session file cannot be parsed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptStatePolicy {
    /// Refuse to start; the file is left untouched for the operator.
    #[default]
    Refuse,
    /// Rename the file aside and start with an empty store.
    Quarantine,
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Path of the sessions file (defaults to `~/.relay/sessions.json`)
    #[serde(default)]
    pub path: Option<String>,

    /// Startup behavior for an unparsable sessions file
    #[serde(default)]
    pub on_corrupt: CorruptStatePolicy,

    /// Upper bound on a single durable write, in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            path: None,
            on_corrupt: CorruptStatePolicy::default(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

impl SessionsConfig {
    /// Resolve the sessions file path.
    pub fn path(&self) -> PathBuf {
        match &self.path {
            Some(p) => expand_path(p),
            None => config_dir().join("sessions.json"),
        }
    }

    /// Write timeout as a `Duration`.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Aliases: "level" for backward compatibility with existing config files
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    /// Aliases: "format" for backward compatibility with existing config files
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to exclude from logging.
    ///
    /// These modules will be set to `warn` level to reduce noise.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// Default value functions
fn default_reconnect_max_secs() -> u64 {
    60
}
fn default_assistant_binary() -> String {
    "claude".into()
}
fn default_assistant_timeout() -> u64 {
    600 // 10 minutes - coding tasks can run long
}
fn default_max_concurrent() -> usize {
    4
}
fn default_strip_env() -> Vec<String> {
    // The claude CLI refuses to start when it believes it is nested in another session
    vec!["CLAUDECODE".into()]
}
fn default_write_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_true() -> bool {
    true
}
