//! querycache Client - Fetch Cache Runtime
//!
//! Keyed cache of asynchronous fetch results. A [`QueryClient`] owns one
//! [`QueryEntry`] per distinct key; each entry runs at most one fetch at a
//! time and broadcasts every state change to its subscribed listeners.
//! [`QueryObserver`] and [`QuerySubscription`] are the consumer-facing views.

pub mod binding;
pub mod client;
pub mod entry;
pub mod fetcher;
pub mod observer;

pub use binding::{current_client, ClientScope, QuerySubscription};
pub use client::QueryClient;
pub use entry::{FetchHandle, QueryEntry, Unsubscribe};
pub use fetcher::QueryFetcher;
pub use observer::QueryObserver;

// Re-export core types so consumers only need this crate
pub use querycache_core::{
    FetchError, QueryClientConfig, QueryError, QueryHash, QueryKey, QueryResult, QueryState,
    QueryStatus,
};
