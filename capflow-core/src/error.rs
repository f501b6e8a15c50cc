use crate::codec::CodecError;
use std::path::PathBuf;

/// Errors raised by the state layer and its persistence backends
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Corrupt state document {path}: {reason}")]
    CorruptStateDocument { path: PathBuf, reason: CodecError },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State layer is shutting down")]
    ShuttingDown,
}

impl StateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
