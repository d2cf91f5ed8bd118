//! Per-consumer view of one entry.

use std::fmt;
use std::sync::Arc;

use querycache_core::QueryState;
use tracing::trace;

use crate::entry::{QueryEntry, Unsubscribe};

/// Binds one consumer to one [`QueryEntry`].
///
/// An observer never changes the entry's state itself; it reads snapshots and
/// relays change notifications to the consumer's callback.
pub struct QueryObserver<T, E> {
    entry: Arc<QueryEntry<T, E>>,
}

impl<T, E> Clone for QueryObserver<T, E> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<T, E> QueryObserver<T, E>
where
    T: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(entry: Arc<QueryEntry<T, E>>) -> Self {
        Self { entry }
    }

    /// The observed entry.
    pub fn entry(&self) -> &Arc<QueryEntry<T, E>> {
        &self.entry
    }

    /// Snapshot of the entry's state, without side effects.
    pub fn current_result(&self) -> QueryState<T, E> {
        self.entry.state()
    }

    /// Subscribe `on_change` to the entry and trigger a fetch.
    ///
    /// The listener is registered before the fetch is requested, so it sees
    /// the start broadcast. If a fetch is already in flight, this joins it
    /// and no start broadcast happens. The returned handle only removes the
    /// listener; the fetch keeps running.
    pub fn attach<F>(&self, on_change: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        let unsubscribe = self.entry.subscribe(on_change);
        if self.entry.config().fetch_on_attach {
            drop(self.entry.fetch());
        } else {
            trace!(hash = %self.entry.hash(), "Attached without fetching");
        }
        unsubscribe
    }
}

impl<T, E> fmt::Debug for QueryObserver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("hash", self.entry.hash())
            .finish()
    }
}
