//! The cache-first request interceptor.
//!
//! A host hands each outbound request to a [`RequestInterceptor`] as a
//! [`FetchEvent`]. [`CacheFirst`] answers it in one of two ways:
//!
//! 1. **Hit** — a stored response exists for the request's key: it is returned
//!    and the network is not touched.
//! 2. **Miss** — the request is fetched. The configured store is opened, the
//!    response is duplicated with [`Response::try_clone`], the copy is written
//!    to the store in the background, and the original is returned.
//!
//! Answers to `HEAD` carry no payload and are returned without being stored,
//! since every method shares the entry for a URL.
//!
//! Lookup and network failures propagate to the host. Store write failures
//! are logged and otherwise ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::cache::{CacheError, CacheStorage, CacheStore};
use crate::config::CacheConfig;
use crate::http::{BodyError, Method, Request, Response};
use crate::network::{FetchError, Fetcher};

/// Why an intercepted request failed.
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("cache lookup failed: {0}")]
    Cache(#[from] CacheError),

    #[error("network request failed: {0}")]
    Network(#[from] FetchError),

    #[error("response could not be duplicated: {0}")]
    Body(#[from] BodyError),
}

/// One interceptable outbound request. Consumed by [`RequestInterceptor::intercept`].
#[derive(Debug)]
pub struct FetchEvent {
    request: Request,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self { request }
    }

    /// The request this event carries.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn into_request(self) -> Request {
        self.request
    }
}

/// Decides how an intercepted request is answered.
///
/// Hosts receive an implementation directly and call it once per event.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, event: FetchEvent) -> BoxFuture<'_, Result<Response, InterceptError>>;
}

/// Counters since construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterceptStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses whose network fetch failed. Included in `misses`.
    pub network_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    network_failures: AtomicU64,
}

/// Cache-first, else fetch-and-store.
///
/// Entries are never revalidated or expired; once a key is stored it is
/// served from the cache for as long as the store keeps it.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use cachefront::cache::MemoryCacheStorage;
/// use cachefront::config::CacheConfig;
/// use cachefront::interceptor::{CacheFirst, FetchEvent, RequestInterceptor};
/// use cachefront::network::HttpFetcher;
/// use cachefront::Request;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let interceptor = CacheFirst::new(
///     Arc::new(MemoryCacheStorage::new()),
///     Arc::new(HttpFetcher::default()),
///     CacheConfig::with_store_name("v1"),
/// );
///
/// let request = Request::get("http://127.0.0.1:8000/app.js")?;
/// let first = interceptor.intercept(FetchEvent::new(request.clone())).await?;   // network
/// interceptor.flush().await;
/// let second = interceptor.intercept(FetchEvent::new(request)).await?;          // cache
/// # Ok(())
/// # }
/// ```
pub struct CacheFirst {
    caches: Arc<dyn CacheStorage>,
    network: Arc<dyn Fetcher>,
    config: CacheConfig,
    counters: Counters,
    // Background store writes not yet awaited by `flush`.
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheFirst {
    pub fn new(
        caches: Arc<dyn CacheStorage>,
        network: Arc<dyn Fetcher>,
        config: CacheConfig,
    ) -> Self {
        Self {
            caches,
            network,
            config,
            counters: Counters::default(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> InterceptStats {
        InterceptStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            network_failures: self.counters.network_failures.load(Ordering::Relaxed),
        }
    }

    /// Waits for every background store write started so far.
    ///
    /// Write failures were already logged when they happened and are not
    /// reported here.
    pub async fn flush(&self) {
        let handles = std::mem::take(&mut *self.lock_pending());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "cache write task did not complete");
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Fire-and-forget: the caller's response never waits on this write.
    fn spawn_store_write(&self, store: Arc<dyn CacheStore>, request: Request, copy: Response) {
        let handle = tokio::spawn(async move {
            match store.put(&request, copy).await {
                Ok(()) => debug!(store = store.name(), url = %request.url(), "stored response"),
                Err(e) => warn!(
                    store = store.name(),
                    url = %request.url(),
                    error = %e,
                    "cache write failed; ignoring"
                ),
            }
        });

        let mut pending = self.lock_pending();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    async fn handle(&self, event: FetchEvent) -> Result<Response, InterceptError> {
        let request = event.into_request();

        if let Some(response) = self.caches.match_request(&request).await? {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(method = %request.method(), url = %request.url(), "cache hit");
            return Ok(response);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(method = %request.method(), url = %request.url(), "cache miss; fetching");

        let response = match self.network.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.counters.network_failures.fetch_add(1, Ordering::Relaxed);
                warn!(url = %request.url(), error = %e, "network fetch failed");
                return Err(e.into());
            }
        };

        if request.method() == &Method::Head {
            debug!(url = %request.url(), "HEAD response not stored");
            return Ok(response);
        }

        let store = self.caches.open(&self.config.store_name).await?;
        let copy = response.try_clone()?;
        self.spawn_store_write(store, request, copy);

        Ok(response)
    }
}

impl RequestInterceptor for CacheFirst {
    fn intercept(&self, event: FetchEvent) -> BoxFuture<'_, Result<Response, InterceptError>> {
        Box::pin(self.handle(event))
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::cache::{CacheKey, MemoryCacheStorage};
    use crate::http::{Method, StatusCode};

    enum Upstream {
        Serve(StatusCode, &'static str),
        Offline,
        // Never answers.
        Hang,
    }

    struct StubFetcher {
        upstream: Upstream,
        calls: AtomicUsize,
    }

    impl StubFetcher {
        fn serving(body: &'static str) -> Arc<Self> {
            Self::with(Upstream::Serve(StatusCode::OK, body))
        }

        fn with(upstream: Upstream) -> Arc<Self> {
            Arc::new(Self {
                upstream,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for StubFetcher {
        fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = match &self.upstream {
                Upstream::Serve(status, body) => {
                    let body = if request.method() == &Method::Head { "" } else { *body };
                    Ok(Response::new(*status)
                        .header("Content-Type", "text/javascript")
                        .body(body))
                }
                Upstream::Offline => Err(FetchError::Connect {
                    addr: "127.0.0.1:9".to_owned(),
                    source: std::io::Error::from(ErrorKind::ConnectionRefused),
                }),
                Upstream::Hang => return Box::pin(std::future::pending()),
            };
            Box::pin(async move { result })
        }
    }

    // Lookups find nothing; every write fails.
    struct ReadOnlyStore;

    impl CacheStore for ReadOnlyStore {
        fn name(&self) -> &str {
            "v1"
        }

        fn match_request<'a>(
            &'a self,
            _request: &'a Request,
        ) -> BoxFuture<'a, Result<Option<Response>, CacheError>> {
            Box::pin(async { Ok(None) })
        }

        fn put<'a>(
            &'a self,
            _request: &'a Request,
            _response: Response,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async {
                Err(CacheError::Io {
                    path: "v1.json".to_owned(),
                    source: std::io::Error::from(ErrorKind::PermissionDenied),
                })
            })
        }

        fn delete<'a>(&'a self, _request: &'a Request) -> BoxFuture<'a, Result<bool, CacheError>> {
            Box::pin(async { Ok(false) })
        }

        fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, CacheError>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    // `broken_lookups` makes every storage call fail.
    struct TestStorage {
        broken_lookups: bool,
    }

    impl TestStorage {
        fn failure() -> CacheError {
            CacheError::Io {
                path: "cache".to_owned(),
                source: std::io::Error::from(ErrorKind::Other),
            }
        }
    }

    impl CacheStorage for TestStorage {
        fn open<'a>(
            &'a self,
            _name: &'a str,
        ) -> BoxFuture<'a, Result<Arc<dyn CacheStore>, CacheError>> {
            let broken = self.broken_lookups;
            Box::pin(async move {
                if broken {
                    return Err(Self::failure());
                }
                Ok(Arc::new(ReadOnlyStore) as Arc<dyn CacheStore>)
            })
        }

        fn get<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<Option<Arc<dyn CacheStore>>, CacheError>> {
            Box::pin(async move { Ok(Some(self.open(name).await?)) })
        }

        fn has<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
            Box::pin(async { Ok(true) })
        }

        fn delete<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
            Box::pin(async { Ok(false) })
        }

        fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
            let broken = self.broken_lookups;
            Box::pin(async move {
                if broken {
                    return Err(Self::failure());
                }
                Ok(vec!["v1".to_owned()])
            })
        }
    }

    // Memory storage whose writes wait for `release` and signal `written`.
    struct GatedStorage {
        inner: Arc<MemoryCacheStorage>,
        release: Arc<Notify>,
        written: Arc<Notify>,
    }

    struct GatedStore {
        inner: Arc<dyn CacheStore>,
        release: Arc<Notify>,
        written: Arc<Notify>,
    }

    impl CacheStore for GatedStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn match_request<'a>(
            &'a self,
            request: &'a Request,
        ) -> BoxFuture<'a, Result<Option<Response>, CacheError>> {
            self.inner.match_request(request)
        }

        fn put<'a>(
            &'a self,
            request: &'a Request,
            response: Response,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async move {
                self.release.notified().await;
                let result = self.inner.put(request, response).await;
                self.written.notify_one();
                result
            })
        }

        fn delete<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, CacheError>> {
            self.inner.delete(request)
        }

        fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, CacheError>> {
            self.inner.keys()
        }
    }

    impl CacheStorage for GatedStorage {
        fn open<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<Arc<dyn CacheStore>, CacheError>> {
            Box::pin(async move {
                let inner = self.inner.open(name).await?;
                Ok(Arc::new(GatedStore {
                    inner,
                    release: Arc::clone(&self.release),
                    written: Arc::clone(&self.written),
                }) as Arc<dyn CacheStore>)
            })
        }

        fn get<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<Option<Arc<dyn CacheStore>>, CacheError>> {
            self.inner.get(name)
        }

        fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
            self.inner.has(name)
        }

        fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
            self.inner.delete(name)
        }

        fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
            self.inner.keys()
        }
    }

    fn app_js() -> Request {
        Request::get("http://localhost:8000/app.js").unwrap()
    }

    fn interceptor(
        caches: Arc<dyn CacheStorage>,
        network: Arc<StubFetcher>,
    ) -> CacheFirst {
        CacheFirst::new(caches, network, CacheConfig::default())
    }

    #[tokio::test]
    async fn miss_fetches_once_and_stores_one_entry() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let network = StubFetcher::serving("console.log(1)");
        let interceptor = interceptor(caches.clone(), network.clone());

        let mut response = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "console.log(1)");
        assert_eq!(network.calls(), 1);

        interceptor.flush().await;
        let store = caches.open("v1").await.unwrap();
        let keys = store.keys().await.unwrap();
        assert_eq!(keys, vec![CacheKey::from_request(&app_js())]);
        let mut stored = store.match_request(&app_js()).await.unwrap().unwrap();
        assert_eq!(stored.text().unwrap(), "console.log(1)");
    }

    #[tokio::test]
    async fn hit_returns_stored_body_without_fetching() {
        let caches = Arc::new(MemoryCacheStorage::new());
        caches
            .open("v1")
            .await
            .unwrap()
            .put(
                &app_js(),
                Response::new(StatusCode::OK).body("console.log(1)"),
            )
            .await
            .unwrap();
        let network = StubFetcher::serving("console.log(2)");
        let interceptor = interceptor(caches, network.clone());

        let mut response = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "console.log(1)");
        assert_eq!(network.calls(), 0);
        assert_eq!(interceptor.stats().hits, 1);
    }

    #[tokio::test]
    async fn second_intercept_never_refetches() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let network = StubFetcher::serving("console.log(1)");
        let interceptor = interceptor(caches, network.clone());

        interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        interceptor.flush().await;
        let mut again = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();

        assert_eq!(again.text().unwrap(), "console.log(1)");
        assert_eq!(network.calls(), 1);
        assert_eq!(
            interceptor.stats(),
            InterceptStats {
                hits: 1,
                misses: 1,
                network_failures: 0,
            }
        );
    }

    #[tokio::test]
    async fn returned_and_stored_bodies_are_independent() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let interceptor = interceptor(caches.clone(), StubFetcher::serving("payload"));

        let mut response = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        assert_eq!(response.bytes().unwrap().as_ref(), b"payload");
        assert!(response.body_used());

        interceptor.flush().await;
        let mut stored = caches.match_request(&app_js()).await.unwrap().unwrap();
        assert_eq!(stored.bytes().unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn offline_miss_fails_and_stores_nothing() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let network = StubFetcher::with(Upstream::Offline);
        let interceptor = interceptor(caches.clone(), network.clone());

        let err = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap_err();
        assert!(matches!(err, InterceptError::Network(FetchError::Connect { .. })));
        assert_eq!(network.calls(), 1);

        interceptor.flush().await;
        assert!(caches.match_request(&app_js()).await.unwrap().is_none());
        assert!(caches.keys().await.unwrap().is_empty());
        assert_eq!(interceptor.stats().network_failures, 1);
    }

    #[tokio::test]
    async fn store_write_failure_does_not_affect_response() {
        let caches = Arc::new(TestStorage {
            broken_lookups: false,
        });
        let interceptor = interceptor(caches, StubFetcher::serving("still served"));

        let mut response = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        interceptor.flush().await;
        assert_eq!(response.text().unwrap(), "still served");
    }

    #[tokio::test]
    async fn lookup_failure_propagates_without_fetching() {
        let caches = Arc::new(TestStorage {
            broken_lookups: true,
        });
        let network = StubFetcher::serving("unused");
        let interceptor = interceptor(caches, network.clone());

        let err = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap_err();
        assert!(matches!(err, InterceptError::Cache(CacheError::Io { .. })));
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn writes_go_to_the_configured_store() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let interceptor = CacheFirst::new(
            caches.clone(),
            StubFetcher::serving("x"),
            CacheConfig::with_store_name("assets-v2"),
        );

        interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        interceptor.flush().await;

        assert_eq!(caches.keys().await.unwrap(), vec!["assets-v2".to_owned()]);
        assert!(!caches.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn methods_share_one_entry() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let network = StubFetcher::serving("console.log(1)");
        let interceptor = interceptor(caches, network.clone());

        interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        interceptor.flush().await;

        let post = Request::new(Method::Post, app_js().url().clone()).body("{}");
        let mut response = interceptor.intercept(FetchEvent::new(post)).await.unwrap();
        assert_eq!(response.text().unwrap(), "console.log(1)");
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn error_statuses_are_cached_like_any_response() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let network = StubFetcher::with(Upstream::Serve(StatusCode::NOT_FOUND, "missing"));
        let interceptor = interceptor(caches, network.clone());

        let first = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        interceptor.flush().await;

        let second = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::NOT_FOUND);
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn head_answers_are_not_stored() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let network = StubFetcher::serving("console.log(1)");
        let interceptor = interceptor(caches.clone(), network.clone());

        let head = Request::new(Method::Head, app_js().url().clone());
        let mut response = interceptor.intercept(FetchEvent::new(head)).await.unwrap();
        assert_eq!(response.text().unwrap(), "");
        interceptor.flush().await;
        assert!(caches.keys().await.unwrap().is_empty());

        let mut get = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        assert_eq!(get.text().unwrap(), "console.log(1)");
        interceptor.flush().await;

        let mut again = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        assert_eq!(again.text().unwrap(), "console.log(1)");
        assert_eq!(network.calls(), 2);
    }

    #[tokio::test]
    async fn dropping_an_unfinished_intercept_stores_nothing() {
        let caches = Arc::new(MemoryCacheStorage::new());
        let network = StubFetcher::with(Upstream::Hang);
        let interceptor = interceptor(caches.clone(), network.clone());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            interceptor.intercept(FetchEvent::new(app_js())),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(network.calls(), 1);

        interceptor.flush().await;
        assert!(caches.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_write_completes_after_the_caller_is_gone() {
        let memory = Arc::new(MemoryCacheStorage::new());
        let gated = Arc::new(GatedStorage {
            inner: memory.clone(),
            release: Arc::new(Notify::new()),
            written: Arc::new(Notify::new()),
        });
        let release = Arc::clone(&gated.release);
        let written = Arc::clone(&gated.written);
        let interceptor = interceptor(gated, StubFetcher::serving("console.log(1)"));

        let mut response = interceptor
            .intercept(FetchEvent::new(app_js()))
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "console.log(1)");
        drop(response);
        drop(interceptor);
        assert!(memory.match_request(&app_js()).await.unwrap().is_none());

        release.notify_one();
        written.notified().await;
        let mut stored = memory.match_request(&app_js()).await.unwrap().unwrap();
        assert_eq!(stored.text().unwrap(), "console.log(1)");
    }
}
