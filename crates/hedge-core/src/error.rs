//! Error types for the hedge coordination engines.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Transport or subscription unavailable. Recovered by periodic reconciliation.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Malformed command or payload, rejected before it reaches the venue.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// The venue rejected a command.
    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("Timeout after {elapsed_ms}ms waiting for {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Two sources disagree. Normally resolved silently by the conflict resolver.
    #[error("Conflict on {key}: {message}")]
    Conflict { key: String, message: String },

    /// A local execution lock outlived the staleness window.
    #[error("Consistency violation: {message}")]
    ConsistencyViolation { message: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Event bus error: {message}")]
    Bus { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Short classification used in logs and status reasons.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Validation { .. } => "validation",
            Self::Execution { .. } => "execution",
            Self::Timeout { .. } => "timeout",
            Self::Conflict { .. } => "conflict",
            Self::ConsistencyViolation { .. } => "consistency_violation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound { .. } => "not_found",
            Self::Store { .. } => "store",
            Self::Bus { .. } => "bus",
            Self::Json(_) => "json",
            Self::ConfigFile(_) | Self::Config { .. } => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
