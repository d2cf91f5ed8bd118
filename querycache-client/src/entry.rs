//! Per-request cache record.
//!
//! A [`QueryEntry`] owns the state of one request, the handle of its
//! in-flight fetch, and the listeners subscribed to it. Every state change
//! goes through [`QueryEntry::mutate`], which replaces the state under the
//! entry lock and then invokes each listener synchronously, in subscription
//! order, after the lock is released. Listeners may therefore read the state,
//! subscribe, unsubscribe or call [`QueryEntry::fetch`] re-entrantly.
//!
//! # Fetch lifecycle
//!
//! A fetch that actually starts produces three broadcasts, in order:
//!
//! 1. start: `is_fetching = true`, previous error cleared
//! 2. result: `Success` with data, or `Error` with the failure
//! 3. settle: `is_fetching = false`, in-flight handle cleared
//!
//! While a fetch is in flight, further calls to `fetch()` join it instead of
//! starting another one. A join made inside a tokio runtime also makes sure
//! the fetch has a live driver task, so a fetch started outside any runtime,
//! or orphaned by a runtime that shut down, still runs to completion.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use querycache_core::{QueryClientConfig, QueryHash, QueryKey, QueryState};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::fetcher::QueryFetcher;

type Listener = Arc<dyn Fn() + Send + Sync>;
type SharedFetch<T, E> = Shared<BoxFuture<'static, QueryState<T, E>>>;

/// Completion signal of an entry's in-flight fetch.
///
/// Every caller that joined the same fetch holds a clone of the same handle.
/// Awaiting it yields the state snapshot taken when that fetch settled.
/// Dropping it does not cancel the fetch.
pub struct FetchHandle<T, E> {
    shared: SharedFetch<T, E>,
}

impl<T, E> FetchHandle<T, E> {
    /// The settled state, if the fetch has already completed.
    pub fn peek(&self) -> Option<&QueryState<T, E>>
    where
        E: Clone,
    {
        self.shared.peek()
    }
}

impl<T, E> Clone for FetchHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E: Clone> Future for FetchHandle<T, E> {
    type Output = QueryState<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.poll_unpin(cx)
    }
}

impl<T, E> fmt::Debug for FetchHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle").finish_non_exhaustive()
    }
}

/// Removes one listener from the entry it was subscribed to.
///
/// Calling it more than once, or through a clone, has the same effect as
/// calling it once.
#[derive(Clone)]
pub struct Unsubscribe {
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl Unsubscribe {
    fn new(remove: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            remove: Arc::new(remove),
        }
    }

    pub fn unsubscribe(&self) {
        (self.remove)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").finish_non_exhaustive()
    }
}

struct Subscriber {
    id: u64,
    listener: Listener,
}

struct InFlight<T, E> {
    id: u64,
    shared: SharedFetch<T, E>,
    driver: Option<JoinHandle<QueryState<T, E>>>,
}

impl<T, E> InFlight<T, E> {
    fn has_live_driver(&self) -> bool {
        self.driver
            .as_ref()
            .is_some_and(|driver| !driver.is_finished())
    }
}

struct EntryInner<T, E> {
    state: QueryState<T, E>,
    in_flight: Option<InFlight<T, E>>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    next_fetch_id: u64,
}

impl<T, E> EntryInner<T, E> {
    fn listeners(&self) -> Vec<Listener> {
        self.subscribers
            .iter()
            .map(|subscriber| Arc::clone(&subscriber.listener))
            .collect()
    }
}

/// Cache record for one distinct [`QueryHash`].
///
/// Entries are created by [`QueryClient::resolve`](crate::QueryClient::resolve)
/// and keep the fetcher they were created with for their whole life.
pub struct QueryEntry<T, E> {
    key: QueryKey,
    config: QueryClientConfig,
    fetcher: Box<dyn QueryFetcher<T, E>>,
    inner: Mutex<EntryInner<T, E>>,
}

impl<T, E> QueryEntry<T, E> {
    /// The key this entry was created for.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn hash(&self) -> &QueryHash {
        self.key.hash()
    }

    /// Configuration inherited from the creating client.
    pub fn config(&self) -> &QueryClientConfig {
        &self.config
    }

    /// Whether a fetch operation is currently running for this entry.
    pub fn is_fetch_in_flight(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    // The guarded data is replaced in single assignments, so a poisoned lock
    // still holds a consistent value.
    fn lock(&self) -> MutexGuard<'_, EntryInner<T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, listeners: Vec<Listener>) {
        trace!(hash = %self.hash(), subscribers = listeners.len(), "Broadcasting state change");
        for listener in listeners {
            listener();
        }
    }

    fn remove_subscriber(&self, id: u64) {
        // The listener may own values whose drop re-enters this entry, so it
        // is dropped after the guard.
        let removed = {
            let mut inner = self.lock();
            inner
                .subscribers
                .iter()
                .position(|subscriber| subscriber.id == id)
                .map(|index| inner.subscribers.remove(index))
        };
        if let Some(subscriber) = removed {
            drop(subscriber);
            trace!(hash = %self.hash(), subscriber = id, "Unsubscribed");
        }
    }
}

impl<T, E> QueryEntry<T, E>
where
    T: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        key: QueryKey,
        fetcher: Box<dyn QueryFetcher<T, E>>,
        config: QueryClientConfig,
    ) -> Self {
        Self {
            key,
            config,
            fetcher,
            inner: Mutex::new(EntryInner {
                state: QueryState::new(),
                in_flight: None,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                next_fetch_id: 0,
            }),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState<T, E> {
        self.lock().state.clone()
    }

    /// Start a fetch, or join the one already in flight.
    ///
    /// A new fetch runs on the ambient tokio runtime and always runs to
    /// completion, even if every handle is dropped and every listener has
    /// unsubscribed. Outside a runtime the fetch only progresses while some
    /// handle is being awaited, until a later call made inside a runtime
    /// joins it and spawns a driver.
    pub fn fetch(self: &Arc<Self>) -> FetchHandle<T, E> {
        let (id, shared, listeners) = {
            let mut inner = self.lock();
            if let Some(in_flight) = inner.in_flight.as_mut() {
                debug!(hash = %self.hash(), "Joining in-flight fetch");
                self.ensure_driver(in_flight);
                return FetchHandle {
                    shared: in_flight.shared.clone(),
                };
            }
            let id = inner.next_fetch_id;
            inner.next_fetch_id += 1;
            let shared = Arc::clone(self).run_fetch().boxed().shared();
            inner.in_flight = Some(InFlight {
                id,
                shared: shared.clone(),
                driver: None,
            });
            inner.state = inner.state.fetching();
            (id, shared, inner.listeners())
        };

        debug!(hash = %self.hash(), "Starting fetch");
        self.broadcast(listeners);

        // Spawned only after the start broadcast so no result can overtake it.
        {
            let mut inner = self.lock();
            if let Some(in_flight) = inner.in_flight.as_mut().filter(|f| f.id == id) {
                self.ensure_driver(in_flight);
            }
        }

        FetchHandle { shared }
    }

    // Called under the entry lock. A driver that finished while its fetch is
    // still in flight was dropped by a runtime shutdown.
    fn ensure_driver(&self, in_flight: &mut InFlight<T, E>) {
        if in_flight.has_live_driver() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                if in_flight.driver.is_some() {
                    warn!(hash = %self.hash(), "Fetch driver stopped before settling; respawning");
                }
                in_flight.driver = Some(runtime.spawn(in_flight.shared.clone()));
            }
            Err(_) => warn!(
                hash = %self.hash(),
                "No tokio runtime; fetch will only run while its handle is awaited"
            ),
        }
    }

    /// Replace the state with `updater(&state)` and notify every listener.
    ///
    /// `updater` runs under the entry lock and must not call back into this
    /// entry.
    pub fn mutate<F>(&self, updater: F)
    where
        F: FnOnce(&QueryState<T, E>) -> QueryState<T, E>,
    {
        let listeners = {
            let mut inner = self.lock();
            inner.state = updater(&inner.state);
            inner.listeners()
        };
        self.broadcast(listeners);
    }

    /// Write data directly, as if a fetch had produced it.
    pub fn set_data(&self, data: T) {
        let data = Arc::new(data);
        self.mutate(|state| state.succeeded(data));
    }

    /// Register `on_change` to be called after every state change.
    pub fn subscribe<F>(self: &Arc<Self>, on_change: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push(Subscriber {
                id,
                listener: Arc::new(on_change),
            });
            id
        };
        trace!(hash = %self.hash(), subscriber = id, "Subscribed");

        let entry = Arc::downgrade(self);
        Unsubscribe::new(move || {
            if let Some(entry) = entry.upgrade() {
                entry.remove_subscriber(id);
            }
        })
    }

    async fn run_fetch(self: Arc<Self>) -> QueryState<T, E> {
        let outcome = AssertUnwindSafe(self.fetcher.fetch()).catch_unwind().await;
        match outcome {
            Ok(Ok(data)) => {
                debug!(hash = %self.hash(), "Fetch succeeded");
                let data = Arc::new(data);
                self.mutate(|state| state.succeeded(data));
            }
            Ok(Err(error)) => {
                debug!(hash = %self.hash(), "Fetch failed");
                let clear_data = self.config.clear_data_on_error;
                self.mutate(|state| state.failed(error, clear_data));
            }
            Err(_) => {
                warn!(hash = %self.hash(), "Fetch panicked; keeping previous result");
            }
        }
        self.settle()
    }

    fn settle(&self) -> QueryState<T, E> {
        let (state, listeners) = {
            let mut inner = self.lock();
            inner.in_flight = None;
            inner.state = inner.state.settled();
            (inner.state.clone(), inner.listeners())
        };
        self.broadcast(listeners);
        state
    }
}

impl<T, E> fmt::Debug for QueryEntry<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("QueryEntry")
            .field("hash", self.key.hash())
            .field("status", &inner.state.status)
            .field("is_fetching", &inner.state.is_fetching)
            .field("subscribers", &inner.subscribers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querycache_core::{FetchError, QueryStatus};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    type Entry = QueryEntry<String, FetchError>;

    fn entry_with<F, Fut>(key: &str, fetcher: F) -> Arc<Entry>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, FetchError>> + Send + 'static,
    {
        Arc::new(QueryEntry::new(
            QueryKey::new(key).unwrap(),
            Box::new(fetcher),
            QueryClientConfig::default(),
        ))
    }

    /// Entry whose fetcher counts calls and waits for a gate permit.
    fn gated_entry(
        calls: &Arc<AtomicUsize>,
        gate: &Arc<Semaphore>,
        outcome: Result<&'static str, &'static str>,
    ) -> Arc<Entry> {
        let calls = Arc::clone(calls);
        let gate = Arc::clone(gate);
        entry_with("gated", move || {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                outcome.map(str::to_string).map_err(FetchError::from)
            }
        })
    }

    fn counter(entry: &Arc<Entry>) -> (Arc<AtomicUsize>, Unsubscribe) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let unsubscribe = entry.subscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, unsubscribe)
    }

    #[test]
    fn test_new_entry_is_loading() {
        let entry = entry_with("fresh", || async { Ok("X".to_string()) });
        let state = entry.state();
        assert_eq!(state.status, QueryStatus::Loading);
        assert!(state.is_fetching);
        assert!(!entry.is_fetch_in_flight());
        assert_eq!(entry.hash().as_str(), r#"["fresh"]"#);
    }

    #[test]
    fn test_mutate_notifies_in_subscription_order() {
        let entry = entry_with("order", || async { Ok("X".to_string()) });
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            let _ = entry.subscribe(move || log.lock().unwrap().push(name));
        }

        entry.mutate(|state| state.settled());

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        assert!(!entry.state().is_fetching);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let entry = entry_with("unsub", || async { Ok("X".to_string()) });
        let (kept, _keep) = counter(&entry);
        let (dropped, unsubscribe) = counter(&entry);

        unsubscribe.unsubscribe();
        unsubscribe.unsubscribe();
        unsubscribe.clone().unsubscribe();
        entry.mutate(|state| state.settled());

        assert_eq!(entry.subscriber_count(), 1);
        assert_eq!(kept.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_can_read_state_during_broadcast() {
        let entry = entry_with("reentrant", || async { Ok("X".to_string()) });
        let seen = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&entry);
        let slot = Arc::clone(&seen);
        let _ = entry.subscribe(move || {
            if let Some(entry) = weak.upgrade() {
                *slot.lock().unwrap() = entry.state().data().cloned();
            }
        });

        entry.set_data("manual".to_string());

        assert_eq!(seen.lock().unwrap().as_deref(), Some("manual"));
        assert!(entry.state().is_success());
    }

    #[tokio::test]
    async fn test_fetch_success_broadcasts_three_times() {
        let entry = entry_with("ok", || async { Ok("X".to_string()) });
        let (count, _unsubscribe) = counter(&entry);

        let state = entry.fetch().await;

        assert_eq!(state.status, QueryStatus::Success);
        assert!(!state.is_fetching);
        assert_eq!(state.data().map(String::as_str), Some("X"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!entry.is_fetch_in_flight());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_captured() {
        let entry = entry_with("err", || async { Err(FetchError::from("boom")) });

        let state = entry.fetch().await;

        assert_eq!(state.status, QueryStatus::Error);
        assert!(!state.is_fetching);
        assert_eq!(state.error().map(FetchError::message), Some("boom"));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let entry = gated_entry(&calls, &gate, Ok("X"));
        let (count, _unsubscribe) = counter(&entry);

        let handles: Vec<_> = (0..5).map(|_| entry.fetch()).collect();
        assert!(entry.is_fetch_in_flight());
        gate.add_permits(1);

        for handle in handles {
            assert_eq!(handle.await.data().map(String::as_str), Some("X"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Only the first call starts a fetch: start, result, settle.
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refetch_after_settle_starts_new_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(2));
        let entry = gated_entry(&calls, &gate, Ok("X"));

        entry.fetch().await;
        entry.fetch().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_runs_without_awaiting_handle() {
        let entry = entry_with("detached", || async { Ok("X".to_string()) });

        drop(entry.fetch());
        for _ in 0..100 {
            if !entry.is_fetch_in_flight() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let state = entry.state();
        assert!(state.is_success());
        assert!(!state.is_fetching);
    }

    #[tokio::test]
    async fn test_panicking_fetch_settles() {
        let entry = entry_with("panics", || async {
            let result: Result<String, FetchError> = Err(FetchError::from("unused"));
            if result.is_err() {
                panic!("fetcher bug");
            }
            result
        });

        let state = entry.fetch().await;

        assert_eq!(state.status, QueryStatus::Loading);
        assert!(!state.is_fetching);
        assert!(!entry.is_fetch_in_flight());
    }

    #[tokio::test]
    async fn test_listener_fetch_during_broadcast_joins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let entry = gated_entry(&calls, &gate, Ok("X"));
        let armed = Arc::new(AtomicBool::new(true));
        let weak = Arc::downgrade(&entry);
        let _ = entry.subscribe(move || {
            if armed.swap(false, Ordering::SeqCst) {
                if let Some(entry) = weak.upgrade() {
                    drop(entry.fetch());
                }
            }
        });

        let handle = entry.fetch();
        gate.add_permits(1);
        handle.await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_uses_subscriber_snapshot() {
        let entry = entry_with("snapshot", || async { Ok("X".to_string()) });
        let late_calls = Arc::new(AtomicUsize::new(0));
        let removed_slot: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));
        let armed = Arc::new(AtomicBool::new(true));

        let weak = Arc::downgrade(&entry);
        let late = Arc::clone(&late_calls);
        let slot = Arc::clone(&removed_slot);
        let _first = entry.subscribe(move || {
            if !armed.swap(false, Ordering::SeqCst) {
                return;
            }
            if let Some(entry) = weak.upgrade() {
                let late = Arc::clone(&late);
                let _ = entry.subscribe(move || {
                    late.fetch_add(1, Ordering::SeqCst);
                });
            }
            if let Some(unsubscribe) = slot.lock().unwrap().take() {
                unsubscribe.unsubscribe();
            }
        });
        let (removed_calls, removed) = counter(&entry);
        *removed_slot.lock().unwrap() = Some(removed);

        entry.mutate(|state| state.settled());
        assert_eq!(removed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        entry.mutate(|state| state.settled());
        assert_eq!(removed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
        assert_eq!(entry.subscriber_count(), 2);
    }

    struct CountOnDrop {
        entry: std::sync::Weak<Entry>,
        seen: Arc<AtomicUsize>,
    }

    impl Drop for CountOnDrop {
        fn drop(&mut self) {
            if let Some(entry) = self.entry.upgrade() {
                self.seen.store(entry.subscriber_count() + 1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_listener_dropped_outside_entry_lock() {
        let entry = entry_with("drop", || async { Ok("X".to_string()) });
        let seen = Arc::new(AtomicUsize::new(0));
        let guard = CountOnDrop {
            entry: Arc::downgrade(&entry),
            seen: Arc::clone(&seen),
        };
        let unsubscribe = entry.subscribe(move || {
            std::hint::black_box(&guard);
        });

        unsubscribe.unsubscribe();

        // The drop read the entry, so it ran with the lock released.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(entry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_peek_reports_settled_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let entry = gated_entry(&calls, &gate, Ok("X"));

        let handle = entry.fetch();
        assert!(handle.peek().is_none());

        gate.add_permits(1);
        let settled = handle.clone().await;

        assert_eq!(handle.peek(), Some(&settled));
        assert_eq!(settled.data().map(String::as_str), Some("X"));
    }

    #[tokio::test]
    async fn test_fetch_after_panic_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let entry = entry_with("panics-once", move || {
            let first = counted.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    panic!("first fetch fails hard");
                }
                Ok("recovered".to_string())
            }
        });

        let after_panic = entry.fetch().await;
        assert!(after_panic.is_loading());
        assert!(!after_panic.is_fetching);

        let retried = entry.fetch().await;
        assert!(retried.is_success());
        assert_eq!(retried.data().map(String::as_str), Some("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
