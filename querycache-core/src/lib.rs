//! querycache Core - Data Types
//!
//! Pure data structures shared by the client and its test utilities: request
//! keys and their canonical hashes, per-entry state, errors, and client
//! configuration. This crate contains no caching or async logic.

pub mod config;
pub mod error;
pub mod key;
pub mod state;

pub use config::QueryClientConfig;
pub use error::{FetchError, QueryError, QueryResult};
pub use key::{QueryHash, QueryKey};
pub use state::{QueryState, QueryStatus};
