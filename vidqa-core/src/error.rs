//! Error types for vidqa-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::IndexingStatus;

/// Main error type for the vidqa-core library
#[derive(Error, Debug)]
pub enum Error {
    /// The current page carries no recognizable content reference
    #[error("no video detected on the current page")]
    NoContentDetected,

    /// Content exists but the service has not finished indexing it
    #[error("video not indexed yet ({status})")]
    NotIndexedYet { status: IndexingStatus },

    /// The service gave up indexing this content
    #[error("indexing failed for this video")]
    IndexingFailed,

    /// Indexing/answering service unreachable or returned an error
    #[error("network error: {0}")]
    Network(String),

    /// Persistence layer unavailable
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The background context could not be reached
    #[error("message channel error: {0}")]
    MessageChannel(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Question was blank after trimming
    #[error("question is empty")]
    EmptyQuestion,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl Error {
    /// Stable classification used when the error is persisted or sent
    /// across the message channel.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoContentDetected => ErrorKind::NoContentDetected,
            Error::NotIndexedYet { .. } => ErrorKind::NotIndexedYet,
            Error::IndexingFailed => ErrorKind::IndexingFailed,
            Error::Network(_) => ErrorKind::NetworkError,
            Error::StoreUnavailable(_) | Error::Io(_) | Error::Json(_) => {
                ErrorKind::StoreUnavailable
            }
            Error::MessageChannel(_) => ErrorKind::MessageChannelError,
            Error::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Error::EmptyQuestion => ErrorKind::InvalidInput,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

/// Serializable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoContentDetected,
    NotIndexedYet,
    IndexingFailed,
    NetworkError,
    StoreUnavailable,
    MessageChannelError,
    SessionNotFound,
    InvalidInput,
    Config,
}

/// Result type alias for vidqa-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_errors_map_to_store_unavailable() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[test]
    fn test_not_indexed_message_includes_progress() {
        let err = Error::NotIndexedYet {
            status: IndexingStatus::Indexing { chunk_count: 12 },
        };
        assert_eq!(err.kind(), ErrorKind::NotIndexedYet);
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NetworkError).unwrap();
        assert_eq!(json, "\"network_error\"");
    }
}
