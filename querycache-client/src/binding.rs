//! Binding adapter for UI-style consumers.
//!
//! The only place a [`QueryClient`] is looked up ambiently. Everything below
//! this layer takes the client as an explicit argument.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use querycache_core::{QueryError, QueryResult, QueryState};
use serde::Serialize;
use tracing::trace;

use crate::client::QueryClient;
use crate::entry::{QueryEntry, Unsubscribe};
use crate::fetcher::QueryFetcher;
use crate::observer::QueryObserver;

thread_local! {
    static AMBIENT: RefCell<Option<QueryClient>> = const { RefCell::new(None) };
}

/// Installs a client as the ambient client of the current thread.
///
/// Scopes nest: dropping a scope restores whatever client was ambient when it
/// was entered. The guard is `!Send` so it is dropped on the thread that
/// entered it.
#[must_use = "the client is only ambient while the scope is alive"]
pub struct ClientScope {
    previous: Option<QueryClient>,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ClientScope {
    pub fn enter(client: QueryClient) -> Self {
        let previous = AMBIENT.with(|ambient| ambient.borrow_mut().replace(client));
        Self {
            previous,
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for ClientScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        AMBIENT.with(|ambient| *ambient.borrow_mut() = previous);
    }
}

impl fmt::Debug for ClientScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientScope")
            .field("restores_previous", &self.previous.is_some())
            .finish()
    }
}

/// The ambient client of the current thread.
///
/// # Errors
///
/// [`QueryError::MissingProvider`] when no [`ClientScope`] is active.
pub fn current_client() -> QueryResult<QueryClient> {
    AMBIENT
        .with(|ambient| ambient.borrow().clone())
        .ok_or(QueryError::MissingProvider)
}

/// One consumer's subscription to one key.
///
/// Create it once per logical subscription, call [`attach`](Self::attach)
/// when the consumer is ready for notifications, and drop it (or call
/// [`detach`](Self::detach)) when the consumer goes away. The listener is
/// removed exactly once.
pub struct QuerySubscription<T, E> {
    observer: QueryObserver<T, E>,
    attached: bool,
    unsubscribe: Option<Unsubscribe>,
}

impl<T, E> QuerySubscription<T, E>
where
    T: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe through the ambient client.
    pub fn new<K, Q>(key: &K, fetcher: Q) -> QueryResult<Self>
    where
        K: Serialize + ?Sized,
        Q: QueryFetcher<T, E>,
    {
        let client = current_client()?;
        Self::with_client(&client, key, fetcher)
    }

    /// Subscribe through an explicit client.
    pub fn with_client<K, Q>(client: &QueryClient, key: &K, fetcher: Q) -> QueryResult<Self>
    where
        K: Serialize + ?Sized,
        Q: QueryFetcher<T, E>,
    {
        let entry = client.resolve_with(key, fetcher)?;
        Ok(Self {
            observer: QueryObserver::new(entry),
            attached: false,
            unsubscribe: None,
        })
    }

    /// Attach `on_change`. Returns `false`, ignoring `on_change`, if this
    /// subscription was attached before.
    pub fn attach<F>(&mut self, on_change: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.attached {
            trace!(hash = %self.entry().hash(), "Subscription already attached");
            return false;
        }
        self.attached = true;
        self.unsubscribe = Some(self.observer.attach(on_change));
        true
    }

    pub fn result(&self) -> QueryState<T, E> {
        self.observer.current_result()
    }

    pub fn entry(&self) -> &Arc<QueryEntry<T, E>> {
        self.observer.entry()
    }

    pub fn is_attached(&self) -> bool {
        self.unsubscribe.is_some()
    }
}

impl<T, E> QuerySubscription<T, E> {
    /// Remove the listener. A detached subscription cannot be re-attached.
    pub fn detach(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe.unsubscribe();
        }
    }
}

impl<T, E> Drop for QuerySubscription<T, E> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<T, E> fmt::Debug for QuerySubscription<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("observer", &self.observer)
            .field("attached", &self.attached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querycache_core::FetchError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_fetcher() -> impl QueryFetcher<u32, FetchError> {
        || async { Ok::<u32, FetchError>(7) }
    }

    #[test]
    fn test_current_client_without_scope_fails() {
        assert_eq!(current_client().unwrap_err(), QueryError::MissingProvider);
        let err = QuerySubscription::<u32, FetchError>::new(&("k",), ok_fetcher()).unwrap_err();
        assert_eq!(err, QueryError::MissingProvider);
    }

    #[test]
    fn test_scopes_nest_and_restore() {
        let outer = QueryClient::new();
        let inner = QueryClient::new();
        inner.resolve_with(&("only-inner",), ok_fetcher()).unwrap();

        let outer_scope = ClientScope::enter(outer);
        {
            let _inner_scope = ClientScope::enter(inner);
            assert_eq!(current_client().unwrap().len(), 1);
        }
        let restored = current_client().unwrap();
        assert!(restored.is_empty());
        drop(outer_scope);
        assert!(current_client().is_err());
    }

    #[test]
    fn test_ambient_subscription_uses_scoped_client() {
        let client = QueryClient::new();
        let _scope = ClientScope::enter(client.clone());

        let subscription = QuerySubscription::new(&("ambient", 1), ok_fetcher()).unwrap();

        assert!(client.contains(&("ambient", 1)).unwrap());
        assert!(!subscription.is_attached());
    }

    #[tokio::test]
    async fn test_attach_once_and_unsubscribe_on_drop() {
        let client = QueryClient::new();
        let mut subscription =
            QuerySubscription::with_client(&client, &("sub",), ok_fetcher()).unwrap();
        let entry = Arc::clone(subscription.entry());
        let count = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&count);
        assert!(subscription.attach(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!subscription.attach(|| {}));
        assert_eq!(entry.subscriber_count(), 1);

        let settled = entry.fetch().await;
        assert_eq!(subscription.result(), settled);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        drop(subscription);
        assert_eq!(entry.subscriber_count(), 0);
    }

    #[test]
    fn test_detach_then_attach_is_noop() {
        let client = QueryClient::with_config(
            querycache_core::QueryClientConfig::new().with_fetch_on_attach(false),
        );
        let mut subscription =
            QuerySubscription::with_client(&client, &("detach",), ok_fetcher()).unwrap();

        assert!(subscription.attach(|| {}));
        subscription.detach();
        subscription.detach();

        assert!(!subscription.attach(|| {}));
        assert_eq!(subscription.entry().subscriber_count(), 0);
    }
}
