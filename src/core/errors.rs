use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Local failures raised inside the connectivity core before or around I/O.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Rate limit wait exceeded timeout for class {0}")]
    RateLimitTimeout(String),

    #[error("Shut down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Client already registered: {exchange}/{account_id}")]
    DuplicateClient { exchange: String, account_id: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Stream session closed")]
    SessionClosed,

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

/// Normalized error categories shared by every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Auth,
    RateLimit,
    InvalidParam,
    Network,
    ExchangeRejected,
    Unknown,
}

impl ErrorKind {
    /// Default retry hint for the kind. Individual codes may override it.
    pub const fn default_retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::Network)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "AUTH",
            Self::RateLimit => "RATE_LIMIT",
            Self::InvalidParam => "INVALID_PARAM",
            Self::Network => "NETWORK",
            Self::ExchangeRejected => "EXCHANGE_REJECTED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// The single error shape callers see, whatever the exchange said.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} [{}]: {raw_message}", raw_code.as_deref().unwrap_or("-"))]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub raw_code: Option<String>,
    pub raw_message: String,
    pub retryable: bool,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, raw_code: Option<String>, raw_message: impl Into<String>) -> Self {
        Self {
            kind,
            raw_code,
            raw_message: raw_message.into(),
            retryable: kind.default_retryable(),
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, None, message)
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParam, None, message)
    }

    pub fn unknown(raw_code: Option<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, raw_code, message)
    }

    /// True for transient transport failures the client may retry on idempotent calls.
    pub fn is_retryable_network(&self) -> bool {
        self.retryable && self.kind == ErrorKind::Network
    }
}

impl From<ExchangeError> for NormalizedError {
    fn from(err: ExchangeError) -> Self {
        let message = err.to_string();
        match err {
            ExchangeError::InvalidCredentials(_) => Self::new(ErrorKind::Auth, None, message),
            ExchangeError::RateLimitTimeout(_) => Self::new(ErrorKind::RateLimit, None, message),
            ExchangeError::NetworkError(_) | ExchangeError::ConnectionTimeout(_) => {
                Self::network(message)
            }
            ExchangeError::Shutdown | ExchangeError::SessionClosed => {
                Self::network(message).with_retryable(false)
            }
            ExchangeError::InvalidParameters(_)
            | ExchangeError::SerializationError(_)
            | ExchangeError::ConfigurationError(_)
            | ExchangeError::DuplicateClient { .. } => Self::invalid_param(message),
            ExchangeError::DeserializationError(_) | ExchangeError::Other(_) => {
                Self::unknown(None, message)
            }
        }
    }
}

impl From<crate::core::config::ConfigError> for ExchangeError {
    fn from(e: crate::core::config::ConfigError) -> Self {
        Self::ConfigurationError(e.to_string())
    }
}
