//! Error taxonomy shared by every transport and the resilience core.
//!
//! Errors are `Clone` because a single failed fetch is handed unchanged to every
//! caller that coalesced onto it.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failure kinds a gateway call can end with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Connection refused, timeout, DNS failure or an unexpected HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or mismatched envelope / payload (bad marker, wrong device identity,
    /// undecodable body).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credentials or device secret rejected.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Remote side signalled rate limiting or temporary unavailability.
    #[error("remote overloaded: {message}")]
    Overload {
        message: String,
        /// Server supplied back-off hint, when present.
        retry_after: Option<Duration>,
    },

    /// Waiting on another caller's in-flight fetch for `key` exceeded the bounded wait.
    #[error("timed out waiting for in-flight fetch of '{key}'")]
    LockTimeout { key: String },

    /// Invalid configuration, or no backend could be selected.
    #[error("configuration error: {0}")]
    Config(String),

    /// The active transport cannot perform this operation.
    #[error("operation not supported by {backend}: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
}

impl GatewayError {
    /// Short stable label, used in logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Transport(_) => "transport",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::Auth(_) => "auth",
            GatewayError::Overload { .. } => "overload",
            GatewayError::LockTimeout { .. } => "lock_timeout",
            GatewayError::Config(_) => "config",
            GatewayError::Unsupported { .. } => "unsupported",
        }
    }

    /// Whether a real (non-cached) outcome carrying this error counts against health.
    ///
    /// Lock timeouts reflect local contention and configuration/unsupported errors never
    /// reached the remote side, so none of them move the health state.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_)
                | GatewayError::Protocol(_)
                | GatewayError::Auth(_)
                | GatewayError::Overload { .. }
        )
    }

    /// Whether a caller's own backoff-and-retry policy may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }

    pub fn overload(message: impl Into<String>) -> Self {
        GatewayError::Overload {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return GatewayError::Protocol(format!("undecodable response body: {err}"));
        }
        if let Some(status) = err.status() {
            return crate::backend::http::error_for_status(status, None, String::new());
        }
        GatewayError::Transport(err.to_string())
    }
}

impl From<prost::DecodeError> for GatewayError {
    fn from(err: prost::DecodeError) -> Self {
        GatewayError::Protocol(format!("envelope decode failed: {err}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Protocol(format!("invalid JSON payload: {err}"))
    }
}
