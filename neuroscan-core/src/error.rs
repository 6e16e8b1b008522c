use thiserror::Error;

use crate::analysis::AnalysisError;
use crate::chat::ChatError;
use crate::inflight::GuardError;
use crate::selection::SelectionError;
use crate::storage::StoreError;
use crate::timestamp::InvalidTimestamp;

/// Coarse classification used to pick HTTP status codes and CLI messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    MalformedResponse,
    NotFound,
    Validation,
    Busy,
    Cancelled,
    Storage,
    Internal,
}

#[derive(Error, Debug)]
pub enum NeuroscanError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<InvalidTimestamp> for NeuroscanError {
    fn from(e: InvalidTimestamp) -> Self {
        NeuroscanError::Validation(e.to_string())
    }
}

impl NeuroscanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NeuroscanError::Analysis(e) => e.kind(),
            NeuroscanError::Chat(e) => e.kind(),
            NeuroscanError::Store(e) => e.kind(),
            NeuroscanError::Selection(_) => ErrorKind::Internal,
            NeuroscanError::Guard(e) => e.kind(),
            NeuroscanError::Validation(_) => ErrorKind::Validation,
            NeuroscanError::NotFound(_) => ErrorKind::NotFound,
            NeuroscanError::Config(_) | NeuroscanError::Io(_) | NeuroscanError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }
}
