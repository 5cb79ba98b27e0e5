//! Configuration validation for the thread relay.
//!
//! Provides validation logic for configuration fields to ensure
//! all required values are present and within valid ranges.

use thiserror::Error;

use crate::config::{AssistantConfig, Config, ObservabilityConfig, SessionsConfig, SlackConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the configuration.
    ///
    /// Slack credentials are only required when `require_slack` is set, so the
    /// local CLI channel can run without them.
    pub fn validate(&self, require_slack: bool) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if require_slack {
            if let Err(e) = self.slack.validate() {
                errors.push(e);
            }
        }

        if let Err(e) = self.assistant.validate() {
            errors.push(e);
        }

        if let Err(e) = self.sessions.validate() {
            errors.push(e);
        }

        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}

impl Validate for SlackConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.bot_token.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "slack.bot_token".into(),
            });
        }
        if self.app_token.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "slack.app_token".into(),
            });
        }
        if !self.app_token.starts_with("xapp-") {
            return Err(ValidationError::InvalidValue {
                field: "slack.app_token".into(),
                reason: "Socket Mode requires an app-level token (xapp-...)".into(),
            });
        }
        Ok(())
    }
}

impl Validate for AssistantConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.binary.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "assistant.binary".into(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "assistant.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_concurrent == 0 {
            return Err(ValidationError::InvalidValue {
                field: "assistant.max_concurrent".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for SessionsConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.write_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "sessions.write_timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if let Some(path) = &self.path {
            if path.trim().is_empty() {
                return Err(ValidationError::InvalidValue {
                    field: "sessions.path".into(),
                    reason: "must not be empty".into(),
                });
            }
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}
