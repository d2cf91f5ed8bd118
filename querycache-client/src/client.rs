//! Request registry.
//!
//! The [`QueryClient`] maps each [`QueryHash`] to the one [`QueryEntry`] that
//! caches it. Entries are created lazily on first resolve and never removed.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use querycache_core::{QueryClientConfig, QueryError, QueryHash, QueryKey, QueryResult};
use serde::Serialize;
use tracing::debug;

use crate::entry::QueryEntry;
use crate::fetcher::QueryFetcher;

type ErasedEntry = Arc<dyn Any + Send + Sync>;

struct ClientInner {
    config: QueryClientConfig,
    entries: Mutex<HashMap<QueryHash, ErasedEntry>>,
}

/// Registry of cached entries.
///
/// Cloning a client is cheap and every clone shares the same entries. Pass
/// it explicitly to whatever needs it; only the outermost binding layer
/// should look it up ambiently (see [`crate::binding`]).
///
/// # Example
///
/// ```ignore
/// let client = QueryClient::new();
/// let entry = client.resolve(&("user", 42), || async {
///     Ok::<_, FetchError>(load_user(42).await)
/// })?;
/// let observer = QueryObserver::new(entry);
/// let unsubscribe = observer.attach(|| request_redraw());
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Create a client with default configuration.
    pub fn new() -> Self {
        Self::with_config(QueryClientConfig::default())
    }

    /// Create a client with the given configuration.
    pub fn with_config(config: QueryClientConfig) -> Self {
        let entries = HashMap::with_capacity(config.initial_capacity);
        Self {
            inner: Arc::new(ClientInner {
                config,
                entries: Mutex::new(entries),
            }),
        }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &QueryClientConfig {
        &self.inner.config
    }

    /// Resolve `key` to its entry, creating it with `fetch_fn` on first use.
    ///
    /// When an entry for the key already exists it is returned unchanged and
    /// `fetch_fn` is dropped without being called: the first registration's
    /// fetch function serves every later caller of the same key.
    ///
    /// # Errors
    ///
    /// - [`QueryError::UnhashableKey`] if the key has no JSON representation;
    ///   no entry is created.
    /// - [`QueryError::EntryTypeMismatch`] if the entry for this key was
    ///   created with a different `T` or `E`.
    pub fn resolve<T, E, K, F, Fut>(
        &self,
        key: &K,
        fetch_fn: F,
    ) -> QueryResult<Arc<QueryEntry<T, E>>>
    where
        T: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        K: Serialize + ?Sized,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.resolve_with(key, fetch_fn)
    }

    /// Like [`resolve`](Self::resolve), for any [`QueryFetcher`].
    pub fn resolve_with<T, E, K, Q>(&self, key: &K, fetcher: Q) -> QueryResult<Arc<QueryEntry<T, E>>>
    where
        T: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        K: Serialize + ?Sized,
        Q: QueryFetcher<T, E>,
    {
        let key = QueryKey::new(key)?;
        let mut entries = self.lock_entries();

        if let Some(existing) = entries.get(key.hash()) {
            debug!(hash = %key.hash(), "Query cache hit, supplied fetcher ignored");
            return downcast(existing, key.hash());
        }

        let entry = Arc::new(QueryEntry::new(
            key,
            Box::new(fetcher),
            self.inner.config.clone(),
        ));
        entries.insert(entry.hash().clone(), Arc::clone(&entry) as ErasedEntry);
        debug!(hash = %entry.hash(), entries = entries.len(), "Created query entry");
        Ok(entry)
    }

    /// Look up the entry for `key` without creating one.
    pub fn get<T, E, K>(&self, key: &K) -> QueryResult<Option<Arc<QueryEntry<T, E>>>>
    where
        T: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        K: Serialize + ?Sized,
    {
        let hash = QueryHash::of(key)?;
        self.lock_entries()
            .get(&hash)
            .map(|existing| downcast(existing, &hash))
            .transpose()
    }

    /// Whether an entry exists for `key`.
    pub fn contains<K>(&self, key: &K) -> QueryResult<bool>
    where
        K: Serialize + ?Sized,
    {
        let hash = QueryHash::of(key)?;
        Ok(self.lock_entries().contains_key(&hash))
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hashes of every cached entry, sorted.
    pub fn hashes(&self) -> Vec<QueryHash> {
        let mut hashes: Vec<QueryHash> = self.lock_entries().keys().cloned().collect();
        hashes.sort();
        hashes
    }

    // Entries are only inserted, so a poisoned map is still consistent.
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<QueryHash, ErasedEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .finish()
    }
}

fn downcast<T, E>(entry: &ErasedEntry, hash: &QueryHash) -> QueryResult<Arc<QueryEntry<T, E>>>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Arc::clone(entry)
        .downcast::<QueryEntry<T, E>>()
        .map_err(|_| QueryError::EntryTypeMismatch {
            hash: hash.clone(),
            expected: type_name::<QueryEntry<T, E>>(),
        })
}
