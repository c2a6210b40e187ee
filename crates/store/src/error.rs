use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode session envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode session envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("session envelope has no version field")]
    MissingVersion,

    #[error("unsupported session envelope version {found}; expected {expected}")]
    UnsupportedVersion { found: u64, expected: u32 },

    #[error("invalid session id '{0}'")]
    InvalidId(String),

    #[error("no session with id '{0}'")]
    NotFound(String),

    #[error("no sessions found under {root}")]
    NoSessions { root: PathBuf },
}

impl StoreError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
