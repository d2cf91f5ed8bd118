//! Client configuration

use serde::{Deserialize, Serialize};

/// Configuration for a query client.
///
/// Every entry copies the configuration of the client that created it, so
/// changing a client's configuration never alters entries it already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryClientConfig {
    /// Whether attaching an observer triggers a fetch.
    pub fetch_on_attach: bool,
    /// Whether a failed fetch drops data left by an earlier success.
    pub clear_data_on_error: bool,
    /// Number of entries the registry allocates room for up front.
    pub initial_capacity: usize,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            fetch_on_attach: true,
            clear_data_on_error: false,
            initial_capacity: 64,
        }
    }
}

impl QueryClientConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable fetching on attach.
    pub fn with_fetch_on_attach(mut self, enabled: bool) -> Self {
        self.fetch_on_attach = enabled;
        self
    }

    /// Enable or disable clearing stale data on error.
    pub fn with_clear_data_on_error(mut self, enabled: bool) -> Self {
        self.clear_data_on_error = enabled;
        self
    }

    /// Set the initial registry capacity.
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }
}
