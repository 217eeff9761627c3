//! Error taxonomy shared by storages and sync engines.
//!
//! Engines branch on the variant: connection failures are retried with
//! backoff, protocol failures surface to one-shot callers, integrity failures
//! skip the offending item and cancellation ends a loop quietly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable, handshake rejected or connect timeout.
    #[error("connection error: {0}")]
    Connection(String),

    /// Remote replied with a structured error payload.
    #[error("protocol error [{name}]: {message}")]
    Protocol { name: String, message: String },

    /// Blob hash mismatch or unparsable CRDT bytes.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The surrounding loop or wait was aborted deliberately.
    #[error("operation cancelled")]
    Cancelled,

    /// Write attempted against a readonly storage.
    #[error("storage is readonly: {0}")]
    Readonly(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub fn protocol(name: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Protocol {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether a background loop should back off and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Connection(_) | StoreError::Io(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<loro::LoroError> for StoreError {
    fn from(err: loro::LoroError) -> Self {
        StoreError::Integrity(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StoreError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StoreError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
