// src/error.rs

//! Unified error handling for the harvester.

use std::fmt;

use thiserror::Error;

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Cursor key or template shape could not be resolved. Fatal for the query.
    #[error("Template error: {0}")]
    Template(String),

    /// Response body could not be parsed, even after cleanup.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The transport adapter call itself failed.
    #[error("Transport error during {context}: {message}")]
    Transport { context: String, message: String },

    /// Transport kept failing after every recovery attempt.
    #[error("Transport still failing after {attempts} recovery attempts: {last}")]
    RecoveryExhausted { attempts: usize, last: String },
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a template error.
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template(message.into())
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Create a transport error with context.
    pub fn transport(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transport {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Whether the stall-recovery path should handle this error.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Http(_))
    }
}
