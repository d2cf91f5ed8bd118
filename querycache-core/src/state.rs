//! Per-entry query state and its transitions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Resolution status of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// No fetch has settled yet.
    Loading,
    /// The last settled fetch produced data.
    Success,
    /// The last settled fetch failed.
    Error,
}

/// Snapshot of a cached entry.
///
/// `is_fetching` is an overlay independent of `status`: a resolved entry can
/// be refetched without leaving `Success` or `Error`.
///
/// Invariants kept by the transition methods:
/// - `Success` implies `data` is set.
/// - `Error` implies `error` is set, except during a refetch: starting a
///   fetch clears the previous error but keeps the status.
/// - `Loading` implies neither has been populated by a fetch yet.
///
/// After an error that follows a success, `data` still holds the last good
/// value unless the entry was configured to clear it.
#[derive(Debug, PartialEq)]
pub struct QueryState<T, E> {
    pub status: QueryStatus,
    pub is_fetching: bool,
    pub data: Option<Arc<T>>,
    pub error: Option<E>,
}

// Manual impl: `data` is behind an `Arc`, so `T` need not be `Clone`.
impl<T, E: Clone> Clone for QueryState<T, E> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            is_fetching: self.is_fetching,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T, E> Default for QueryState<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> QueryState<T, E> {
    /// State of a freshly created entry: loading, with a fetch expected.
    pub fn new() -> Self {
        Self {
            status: QueryStatus::Loading,
            is_fetching: true,
            data: None,
            error: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_deref()
    }

    pub fn error(&self) -> Option<&E> {
        self.error.as_ref()
    }
}

impl<T, E: Clone> QueryState<T, E> {
    /// A fetch has started: mark fetching and drop the previous error.
    pub fn fetching(&self) -> Self {
        Self {
            is_fetching: true,
            error: None,
            ..self.clone()
        }
    }

    /// A fetch produced `data`.
    pub fn succeeded(&self, data: Arc<T>) -> Self {
        Self {
            status: QueryStatus::Success,
            data: Some(data),
            ..self.clone()
        }
    }

    /// A fetch failed with `error`.
    pub fn failed(&self, error: E, clear_data: bool) -> Self {
        Self {
            status: QueryStatus::Error,
            error: Some(error),
            data: if clear_data { None } else { self.data.clone() },
            ..self.clone()
        }
    }

    /// The in-flight fetch has settled, whatever its outcome.
    pub fn settled(&self) -> Self {
        Self {
            is_fetching: false,
            ..self.clone()
        }
    }
}
