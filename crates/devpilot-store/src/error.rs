use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid session: {reason}")]
    InvalidSession { reason: String },

    #[error("session {id} serializes to {size} bytes, above the {limit} byte limit")]
    TooLarge { id: String, size: u64, limit: u64 },

    #[error("session not found: {id}")]
    NotFound { id: String },

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to {operation} session JSON at {path}: {source}")]
    Serde {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidSession {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serde(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Serde {
            operation,
            path: path.into(),
            source,
        }
    }
}
