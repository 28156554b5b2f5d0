//! Chat controller errors.

use agent_link_core::{CorrelationError, TransportError};
use thiserror::Error;

/// Failure of a chat operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Missing configuration or identity.
    #[error("Initialization failed: {0}")]
    Initialization(String),
    #[error("No active chat session")]
    NoSession,
    #[error("Transport error: {0}")]
    Transport(TransportError),
    /// The backend reported an error. The text is for logs only.
    #[error("The assistant could not complete the request")]
    Backend(String),
    /// Superseded by a newer request or session.
    #[error("Request cancelled")]
    Cancelled,
    #[error("No acknowledgement: {0}")]
    Ack(#[from] CorrelationError),
}

impl From<TransportError> for ChatError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Backend(reason) => Self::Backend(reason),
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_text_not_displayed() {
        let err = ChatError::from(TransportError::Backend("db password wrong".into()));
        assert_eq!(err, ChatError::Backend("db password wrong".into()));
        assert!(!err.to_string().contains("password"));
    }

    #[test]
    fn test_transport_errors_pass_through() {
        let err = ChatError::from(TransportError::Closed);
        assert_eq!(err, ChatError::Transport(TransportError::Closed));
    }
}
