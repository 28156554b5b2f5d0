//! Call controller errors.

use std::time::Duration;

use agent_link_core::{MediaError, TransportError};
use thiserror::Error;

/// Failure of a call operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
    #[error("Signaling error: {0}")]
    Signaling(TransportError),
    #[error("Signaling connection closed")]
    SignalingClosed,
    /// The remote side sent an `error` frame.
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("No answer within {0:?}")]
    Timeout(Duration),
    #[error("No active call")]
    NotConnected,
    #[error("No local audio track")]
    NoLocalMedia,
    /// The call was ended or replaced while starting.
    #[error("Call cancelled")]
    Cancelled,
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => Self::SignalingClosed,
            other => Self::Signaling(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_socket_maps_to_signaling_closed() {
        assert_eq!(CallError::from(TransportError::Closed), CallError::SignalingClosed);
        assert_eq!(
            CallError::from(TransportError::Connect("refused".into())),
            CallError::Signaling(TransportError::Connect("refused".into()))
        );
    }

    #[test]
    fn test_media_errors_convert() {
        let err: CallError = MediaError::Unavailable("no microphone".into()).into();
        assert_eq!(err.to_string(), "Media error: Media unavailable: no microphone");
    }
}
