use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the retrieval loop should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The pipe went away; reconnect right away without growing the backoff.
    Unavailable,
    /// Nothing arrived before the read deadline; an idle socket, not a failure.
    Timeout,
    /// Anything else; counts as a failed attempt.
    Generic,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport read timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Unavailable(_) => FailureKind::Unavailable,
            TransportError::Timeout => FailureKind::Timeout,
            TransportError::Fatal(_) => FailureKind::Generic,
        }
    }
}
