use shared::error::{FailureKind, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("batch transaction failed: {0:#}")]
    StorageTransaction(#[source] anyhow::Error),
    #[error("failed to acknowledge envelope after commit: {0}")]
    Ack(#[source] TransportError),
}

impl RetrievalError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RetrievalError::Transport(err) => err.kind(),
            RetrievalError::StorageTransaction(_) => FailureKind::Generic,
            RetrievalError::Ack(err) => match err.kind() {
                FailureKind::Unavailable => FailureKind::Unavailable,
                _ => FailureKind::Generic,
            },
        }
    }
}

pub type RetrievalResult<T> = std::result::Result<T, RetrievalError>;
