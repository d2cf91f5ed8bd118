//! The fetch function an entry runs to produce its data.

use std::future::Future;

use async_trait::async_trait;

/// Produces the value for one query key.
///
/// Any `Fn() -> impl Future<Output = Result<T, E>>` closure is a fetcher.
/// Implement the trait directly for fetchers that carry their own client or
/// configuration.
#[async_trait]
pub trait QueryFetcher<T, E>: Send + Sync + 'static {
    /// Run one fetch. Called at most once at a time per entry.
    async fn fetch(&self) -> Result<T, E>;
}

#[async_trait]
impl<T, E, F, Fut> QueryFetcher<T, E> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    async fn fetch(&self) -> Result<T, E> {
        (self)().await
    }
}
