//! Transport and media error types.

use std::time::Duration;

use thiserror::Error;

/// Network-level failure talking to the backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("Channel closed")]
    Closed,
    #[error("Stream interrupted: {0}")]
    Interrupted(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// The backend answered with an explicit error payload.
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the failure happened before any connection was made.
    #[must_use]
    pub const fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Failure in local media or peer negotiation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media unavailable: {0}")]
    Unavailable(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("No active peer connection")]
    NoConnection,
}
