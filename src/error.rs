//! Error types for agent operations
//!
//! Every fallible agent operation returns an [`AgentResult`]. Each error maps to
//! a closed [`ErrorKind`] and a stable non-zero status code, so callers that
//! only care about "did it work" can branch on [`AgentError::code`].

use crate::agent::lifecycle::{AgentState, Operation};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Allocation error: {message}")]
    Allocation { message: String },

    #[error("Invalid state: cannot {operation} while agent is {state}")]
    InvalidState {
        operation: Operation,
        state: AgentState,
    },

    #[error("Connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Settings timeout: no reply from broker within {timeout_ms} ms")]
    SettingsTimeout { timeout_ms: u64 },

    #[error("Encoding error: {message}")]
    Encoding { message: String },

    #[error("Decoding error: {message}")]
    Decoding { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Closed classification of [`AgentError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Allocation,
    InvalidState,
    Connection,
    SettingsTimeout,
    Encoding,
    Decoding,
    Protocol,
    Configuration,
}

impl ErrorKind {
    /// Non-zero status code reported for this kind
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Allocation => 1,
            ErrorKind::InvalidState => 2,
            ErrorKind::Connection => 3,
            ErrorKind::SettingsTimeout => 4,
            ErrorKind::Encoding => 5,
            ErrorKind::Decoding => 6,
            ErrorKind::Protocol => 7,
            ErrorKind::Configuration => 8,
        }
    }
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Allocation { .. } => ErrorKind::Allocation,
            AgentError::InvalidState { .. } => ErrorKind::InvalidState,
            AgentError::Connection(_) => ErrorKind::Connection,
            AgentError::SettingsTimeout { .. } => ErrorKind::SettingsTimeout,
            AgentError::Encoding { .. } => ErrorKind::Encoding,
            AgentError::Decoding { .. } => ErrorKind::Decoding,
            AgentError::Protocol { .. } => ErrorKind::Protocol,
            AgentError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Status code of this error (never 0)
    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    /// Description suitable for `last_error()`, with secrets redacted
    pub fn description(&self) -> String {
        sanitize_error_message(&self.to_string())
    }

    /// Create allocation error
    pub fn allocation<S: Into<String>>(message: S) -> Self {
        Self::Allocation {
            message: message.into(),
        }
    }

    /// Create invalid state error
    pub fn invalid_state(operation: Operation, state: AgentState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Wrap a transport failure
    pub fn connection<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection(Box::new(error))
    }

    /// Create connection error from a plain description
    pub fn connection_msg<S: Into<String>>(message: S) -> Self {
        Self::Connection(message.into().into())
    }

    /// Create settings timeout error
    pub fn settings_timeout(timeout_ms: u64) -> Self {
        Self::SettingsTimeout { timeout_ms }
    }

    /// Create encoding error
    pub fn encoding<S: Into<String>>(message: S) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create decoding error
    pub fn decoding<S: Into<String>>(message: S) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Create protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static URL_CREDENTIALS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-zA-Z][a-zA-Z0-9+.-]*://)[^/@\s:]+:[^/@\s]+@")
        .expect("credential pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_DESCRIPTION_LEN: usize = 500;

/// Redact credentials and sensitive paths, then bound the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = URL_CREDENTIALS_PATTERN
        .replace_all(&sanitized, "${1}***@")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_DESCRIPTION_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_DESCRIPTION_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for Agent operations
pub type AgentResult<T> = Result<T, AgentError>;
