use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransportUnavailable,
    AuthenticationRejected,
    DeletionRejected,
    ValidationFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("authentication rejected")]
    AuthenticationRejected,
    #[error("deletion rejected: {0}")]
    DeletionRejected(String),
    #[error("validation failed: {0}")]
    ValidationFailure(String),
}

impl SessionError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportUnavailable(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailure(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            SessionError::AuthenticationRejected => ErrorKind::AuthenticationRejected,
            SessionError::DeletionRejected(_) => ErrorKind::DeletionRejected,
            SessionError::ValidationFailure(_) => ErrorKind::ValidationFailure,
        }
    }
}
