//! querycache Test Utilities
//!
//! Shared test infrastructure for the querycache workspace:
//! - Controllable fetchers that count calls and wait for a release
//! - Recorders for listener notifications and state snapshots
//! - Proptest generators for query keys
//! - Assertions for the state invariants

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde::ser::{Error as _, Serialize, Serializer};
use tokio::sync::Semaphore;

// Re-export client and core types for convenience
pub use querycache_client::{
    FetchError, QueryClient, QueryClientConfig, QueryEntry, QueryError, QueryFetcher,
    QueryObserver, QueryResult, QueryState, QueryStatus, Unsubscribe,
};

// A panicking test thread must not hide what was recorded before it.
fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MOCK FETCHERS
// ============================================================================

struct GatedInner<T, E> {
    calls: AtomicUsize,
    gate: Semaphore,
    outcome: Mutex<Result<T, E>>,
}

/// Fetcher that counts its invocations and blocks each one until released.
///
/// Clones share the call counter, gate and outcome, so a test can keep one
/// clone and hand the other to [`QueryClient::resolve_with`].
pub struct GatedFetcher<T, E> {
    inner: Arc<GatedInner<T, E>>,
}

impl<T, E> Clone for GatedFetcher<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> GatedFetcher<T, E> {
    fn with_outcome(outcome: Result<T, E>) -> Self {
        Self {
            inner: Arc::new(GatedInner {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                outcome: Mutex::new(outcome),
            }),
        }
    }

    /// A fetcher that succeeds with `value` once released.
    pub fn resolving(value: T) -> Self {
        Self::with_outcome(Ok(value))
    }

    /// A fetcher that fails with `error` once released.
    pub fn failing(error: E) -> Self {
        Self::with_outcome(Err(error))
    }

    /// Like [`resolving`](Self::resolving), but never blocks.
    pub fn ready(value: T) -> Self {
        let fetcher = Self::resolving(value);
        fetcher.open();
        fetcher
    }

    /// Change what subsequent fetches return.
    pub fn set_outcome(&self, outcome: Result<T, E>) {
        *lock(&self.inner.outcome) = outcome;
    }

    /// Let one blocked (or the next) fetch complete.
    pub fn release(&self) {
        self.inner.gate.add_permits(1);
    }

    /// Let every current and future fetch complete without blocking.
    pub fn open(&self) {
        self.inner.gate.close();
    }

    /// Number of times the fetch function has been invoked.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T, E> QueryFetcher<T, E> for GatedFetcher<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn fetch(&self) -> Result<T, E> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        // A closed gate lets everything through.
        if let Ok(permit) = self.inner.gate.acquire().await {
            permit.forget();
        }
        lock(&self.inner.outcome).clone()
    }
}

// ============================================================================
// RECORDERS
// ============================================================================

/// Counts listener notifications.
#[derive(Debug, Clone, Default)]
pub struct NotificationRecorder {
    count: Arc<AtomicUsize>,
}

impl NotificationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener that bumps this recorder's count.
    pub fn callback(&self) -> impl Fn() + Send + Sync + 'static {
        let count = Arc::clone(&self.count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Records the entry state seen by a listener at each notification.
pub struct StateLog<T, E> {
    snapshots: Arc<Mutex<Vec<QueryState<T, E>>>>,
}

impl<T, E> Default for StateLog<T, E> {
    fn default() -> Self {
        Self {
            snapshots: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T, E> Clone for StateLog<T, E> {
    fn clone(&self) -> Self {
        Self {
            snapshots: Arc::clone(&self.snapshots),
        }
    }
}

impl<T, E> StateLog<T, E>
where
    T: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener that snapshots `entry`'s state when notified.
    ///
    /// Holds the entry weakly so subscribing it does not create a cycle.
    pub fn callback_for(
        &self,
        entry: &Arc<QueryEntry<T, E>>,
    ) -> impl Fn() + Send + Sync + 'static {
        let entry: Weak<QueryEntry<T, E>> = Arc::downgrade(entry);
        let snapshots = Arc::clone(&self.snapshots);
        move || {
            if let Some(entry) = entry.upgrade() {
                lock(&snapshots).push(entry.state());
            }
        }
    }

    pub fn snapshots(&self) -> Vec<QueryState<T, E>> {
        lock(&self.snapshots).clone()
    }

    /// `(status, is_fetching)` of each snapshot, in notification order.
    pub fn transitions(&self) -> Vec<(QueryStatus, bool)> {
        lock(&self.snapshots)
            .iter()
            .map(|state| (state.status, state.is_fetching))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.snapshots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// KEYS
// ============================================================================

/// A key component that refuses to serialize.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unhashable;

impl Serialize for Unhashable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("value has no JSON representation"))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for query keys and fetch outcomes.

    use proptest::prelude::*;
    use serde_json::Value;

    /// Generate a single key component: a scalar or a small nested value.
    pub fn arb_key_part() -> impl Strategy<Value = Value> {
        let scalar = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{1,8}".prop_map(Value::from),
        ];
        scalar.prop_recursive(2, 8, 3, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..3).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..3)
                    .prop_map(|members| Value::Object(members.into_iter().collect())),
            ]
        })
    }

    /// Generate the parts of a query key.
    pub fn arb_query_key() -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec(arb_key_part(), 0..4)
    }

    /// Generate a fetch outcome: `Ok(data)` or `Err(message)`.
    pub fn arb_outcome() -> impl Strategy<Value = Result<String, String>> {
        prop_oneof![
            "[A-Za-z0-9]{1,12}".prop_map(Ok::<String, String>),
            "[a-z ]{1,24}".prop_map(Err::<String, String>),
        ]
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Checks for the state invariants of a settled entry.

    use super::*;

    /// Assert the status/data/error invariants of a state with no fetch in
    /// flight.
    pub fn assert_settled_invariants<T: std::fmt::Debug, E: std::fmt::Debug>(
        state: &QueryState<T, E>,
    ) {
        assert!(!state.is_fetching, "Expected settled state, got {:?}", state);
        match state.status {
            QueryStatus::Success => {
                assert!(state.data.is_some(), "Success without data: {:?}", state);
            }
            QueryStatus::Error => {
                assert!(state.error.is_some(), "Error without error: {:?}", state);
            }
            QueryStatus::Loading => {
                assert!(
                    state.data.is_none() && state.error.is_none(),
                    "Loading with a result: {:?}",
                    state
                );
            }
        }
    }

    /// Assert the exact notification sequence of one fetch started from a
    /// settled or fresh entry: start, result, settle.
    pub fn assert_fetch_transitions(transitions: &[(QueryStatus, bool)], outcome: QueryStatus) {
        assert_eq!(
            transitions.len(),
            3,
            "Expected start, result and settle notifications, got {:?}",
            transitions
        );
        assert!(transitions[0].1, "Start notification not fetching");
        assert_eq!(transitions[1], (outcome, true));
        assert_eq!(transitions[2], (outcome, false));
    }
}
