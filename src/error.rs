//! Error types for the data engine.
//!
//! The application layer wraps these in `color_eyre::Report`; see
//! [`crate::error_display`] for the messages shown to users.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store schema is already set; reset the store before defining new columns")]
    AlreadyInitialized,
    #[error("store has no schema; columns must be set before rows are appended")]
    NotInitialized,
    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),
    #[error("row {row} has {found} cells but the table has {expected} columns")]
    SchemaMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Failures worth another attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransientNetworkError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded with HTTP {status}")]
    Status { status: u16 },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("response body is not valid JSON: {0}")]
    MalformedBody(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: TransientNetworkError,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    SchemaMismatch(#[from] StoreError),
    /// Superseded by a newer request. Callers drop this silently.
    #[error("request was cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("could not open stream: {0}")]
    Connect(String),
    #[error("stream transport failed: {0}")]
    Transport(String),
    #[error("server reported an error: {0}")]
    Server(String),
    #[error("malformed '{event}' event: {message}")]
    Decode { event: String, message: String },
    #[error("stream ended before the completion event")]
    UnexpectedEnd,
    #[error(transparent)]
    SchemaMismatch(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("nothing to export: the result has no columns")]
    NoSchema,
    #[error("result changed during export: expected at least {expected} rows, found {found}")]
    StoreChanged { expected: usize, found: usize },
    #[error("CSV delimiter must be a single ASCII character other than '\"', got {0:?}")]
    InvalidDelimiter(char),
    #[error("failed to encode CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write export: {0}")]
    Io(#[from] std::io::Error),
}
