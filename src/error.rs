use std::path::PathBuf;

use chat_protocol::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("no session is selected")]
    NoCurrentSession,

    #[error("unknown session '{0}'")]
    SessionNotFound(String),

    #[error("message has no content")]
    EmptyMessage,
}

impl StoreError {
    #[must_use]
    pub fn transport(operation: &'static str, source: TransportError) -> Self {
        Self::Transport { operation, source }
    }

    /// The underlying transport failure, if this error came from one.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode persisted state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode persisted state: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("persisted state has unsupported version {found}; expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
}

impl PersistenceError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
