//! Failure taxonomy shared by transports, connections, and pollers.

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

/// Failure observed while opening or reading a stream transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Connection refused, reset, or handshake failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single frame was malformed or carried an unknown discriminator.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credentials were rejected on connect or reconnect.
    #[error("authorization rejected: {0}")]
    Auth(String),

    /// The backend signalled throttling.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// No frame arrived within the idle window.
    #[error("no frame received within {0:?}")]
    Timeout(Duration),
}

impl StreamError {
    /// Fatal errors close the connection without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Backend supplied hint for the earliest retry.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-readable class name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Payload carried by terminal `error` canonical events.
    pub fn to_payload(&self) -> Value {
        json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

/// Parses an HTTP `Retry-After` header given in delta seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
