//! Error types for querycache operations

use crate::QueryHash;
use thiserror::Error;

/// Errors that propagate to the caller of a registry or binding operation.
///
/// Fetch failures are deliberately absent: they are captured into the
/// entry's state and never surface here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unhashable query key: {reason}")]
    UnhashableKey { reason: String },

    #[error("No query client is in scope for this thread")]
    MissingProvider,

    #[error("Entry {hash} was created with a different result type than {expected}")]
    EntryTypeMismatch {
        hash: QueryHash,
        expected: &'static str,
    },
}

/// Default error type for fetchers that have no error type of their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Fetch failed: {message}")]
pub struct FetchError {
    message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message the fetcher failed with.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Result type alias for querycache operations.
pub type QueryResult<T> = Result<T, QueryError>;

// =============================================================================
// TESTS
// =============================================================================
