//! Whole-result retrieval with caching, retry and cancellation.

use crate::cache::{CacheStats, ResultCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use crate::error::{FetchError, TransientNetworkError};
use crate::request::{endpoint_url, QueryRequest};
use crate::response::decode_result;
use crate::store::ColumnarStore;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues one GET request. Non-2xx responses are returned as `Ok`; the
/// fetcher decides what is retryable.
pub trait QueryTransport: Send + Sync + 'static {
    fn get(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransientNetworkError>> + Send;
}

/// Async reqwest client. Dropping the returned future aborts the request
/// and closes its connection, so a superseded fetch frees the socket at once.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> TransientNetworkError {
    if err.is_timeout() {
        TransientNetworkError::Timeout(timeout)
    } else {
        TransientNetworkError::Network(err.to_string())
    }
}

impl QueryTransport for ReqwestTransport {
    fn get(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransientNetworkError>> + Send {
        let call = self
            .client
            .get(&request.url)
            .query(&request.query)
            .timeout(request.timeout);
        let timeout = request.timeout;
        async move {
            let response = call.send().await.map_err(|e| transport_error(e, timeout))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            Ok(HttpResponse { status, body })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub base_url: String,
    pub query_path: String,
    /// Total attempts for one fetch, the first one included
    pub max_retries: u32,
    /// Delay after failed attempt `n` is `n * base_delay`
    pub base_delay: Duration,
    pub timeout: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            query_path: "api/query".to_string(),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(300),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub network_requests: u64,
    pub cache: CacheStats,
}

struct InFlight {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

enum AttemptError {
    Transient(TransientNetworkError),
    Fatal(FetchError),
}

/// Fetches complete results. One request is live at a time: starting a fetch
/// cancels the one before it, and the cancelled call resolves to
/// [`FetchError::Cancelled`] without touching the cache.
pub struct DataFetcher<T> {
    transport: T,
    options: FetchOptions,
    cache: Mutex<ResultCache<Arc<ColumnarStore>>>,
    inflight: Mutex<InFlight>,
    network_requests: AtomicU64,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: QueryTransport> DataFetcher<T> {
    pub fn new(transport: T, options: FetchOptions) -> Self {
        let cache = ResultCache::new(options.cache_capacity, options.cache_ttl);
        Self {
            transport,
            options,
            cache: Mutex::new(cache),
            inflight: Mutex::new(InFlight {
                generation: 0,
                cancel: None,
            }),
            network_requests: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn fetch(&self, request: &QueryRequest) -> Result<Arc<ColumnarStore>, FetchError> {
        let (generation, mut cancelled) = self.begin();
        let key = request.cache_key();

        let hit = lock(&self.cache).get(&key, now());
        if let Some(store) = hit {
            debug!("cache hit for question {}", request.question_id);
            self.finish(generation);
            return Ok(store);
        }

        let outcome = tokio::select! {
            biased;
            _ = &mut cancelled => {
                debug!("fetch for question {} cancelled", request.question_id);
                return Err(FetchError::Cancelled);
            }
            outcome = self.fetch_with_retry(request) => outcome,
        };

        let mut inflight = lock(&self.inflight);
        if inflight.generation != generation {
            return Err(FetchError::Cancelled);
        }
        inflight.cancel = None;
        drop(inflight);

        let store = Arc::new(outcome?);
        info!(
            "question {}: {} rows x {} columns",
            request.question_id,
            store.row_count(),
            store.column_count()
        );
        lock(&self.cache).insert(key, Arc::clone(&store), now());
        Ok(store)
    }

    /// Cancel the live request, if any.
    pub fn cancel(&self) {
        let mut inflight = lock(&self.inflight);
        inflight.generation += 1;
        inflight.cancel = None;
    }

    /// Drop every cached result (memory pressure relief).
    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
        debug!("fetch cache cleared");
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            network_requests: self.network_requests.load(Ordering::Relaxed),
            cache: lock(&self.cache).stats(),
        }
    }

    fn begin(&self) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut inflight = lock(&self.inflight);
        inflight.generation += 1;
        // dropping the previous sender wakes the superseded fetch
        inflight.cancel = Some(tx);
        (inflight.generation, rx)
    }

    fn finish(&self, generation: u64) {
        let mut inflight = lock(&self.inflight);
        if inflight.generation == generation {
            inflight.cancel = None;
        }
    }

    async fn fetch_with_retry(&self, request: &QueryRequest) -> Result<ColumnarStore, FetchError> {
        let attempts = self.options.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(request).await {
                Ok(store) => return Ok(store),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) if attempt < attempts => {
                    let delay = self.options.base_delay * attempt;
                    warn!(
                        "attempt {}/{} for question {} failed: {}; retrying in {:?}",
                        attempt, attempts, request.question_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(AttemptError::Transient(source)) => {
                    return Err(FetchError::Exhausted {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    async fn attempt(&self, request: &QueryRequest) -> Result<ColumnarStore, AttemptError> {
        let http = HttpRequest {
            url: endpoint_url(&self.options.base_url, &self.options.query_path),
            query: request.query_pairs(),
            timeout: self.options.timeout,
        };
        self.network_requests.fetch_add(1, Ordering::Relaxed);
        debug!("GET {} {:?}", http.url, http.query);

        let response = tokio::time::timeout(self.options.timeout, self.transport.get(http))
            .await
            .map_err(|_| AttemptError::Transient(TransientNetworkError::Timeout(self.options.timeout)))?
            .map_err(AttemptError::Transient)?;

        if !response.is_success() {
            return Err(AttemptError::Transient(TransientNetworkError::Status {
                status: response.status,
            }));
        }
        let body: serde_json::Value = serde_json::from_str(&response.body).map_err(|e| {
            AttemptError::Transient(TransientNetworkError::MalformedBody(e.to_string()))
        })?;
        decode_result(&body).map_err(AttemptError::Fatal)
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Replays canned responses, one per call.
    struct Scripted {
        responses: Mutex<VecDeque<Result<HttpResponse, TransientNetworkError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(responses: Vec<Result<HttpResponse, TransientNetworkError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl QueryTransport for Scripted {
        fn get(
            &self,
            _request: HttpRequest,
        ) -> impl Future<Output = Result<HttpResponse, TransientNetworkError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = lock(&self.responses)
                .pop_front()
                .unwrap_or_else(|| Err(TransientNetworkError::Network("script exhausted".into())));
            async move { next }
        }
    }

    const TABLE: &str = r#"{"data":{"cols":[{"name":"n","base_type":"type/Integer"}],"rows":[[1],[2]]}}"#;

    #[tokio::test(start_paused = true)]
    async fn test_non_json_body_is_retried() {
        let transport = Scripted::new(vec![
            Ok(HttpResponse::ok("<html>gateway</html>")),
            Ok(HttpResponse::ok(TABLE)),
        ]);
        let fetcher = DataFetcher::new(transport, FetchOptions::default());
        let store = fetcher.fetch(&QueryRequest::new(1u64)).await.unwrap();
        assert_eq!(store.row_count(), 2);
        assert_eq!(fetcher.transport().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_shape_is_not_retried() {
        let transport = Scripted::new(vec![Ok(HttpResponse::ok(r#"{"rows": []}"#))]);
        let fetcher = DataFetcher::new(transport, FetchOptions::default());
        let err = fetcher.fetch(&QueryRequest::new(1u64)).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidResponse(_)));
        assert_eq!(fetcher.stats().network_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_last_error() {
        let transport = Scripted::new(vec![
            Ok(HttpResponse {
                status: 502,
                body: String::new(),
            }),
            Err(TransientNetworkError::Network("reset".into())),
            Ok(HttpResponse {
                status: 503,
                body: String::new(),
            }),
        ]);
        let fetcher = DataFetcher::new(transport, FetchOptions::default());
        let err = fetcher.fetch(&QueryRequest::new(1u64)).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Exhausted {
                attempts: 3,
                source: TransientNetworkError::Status { status: 503 }
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache_forces_refetch() {
        let transport = Scripted::new(vec![Ok(HttpResponse::ok(TABLE)), Ok(HttpResponse::ok(TABLE))]);
        let fetcher = DataFetcher::new(transport, FetchOptions::default());
        let request = QueryRequest::new(9u64);
        fetcher.fetch(&request).await.unwrap();
        fetcher.fetch(&request).await.unwrap();
        assert_eq!(fetcher.stats().network_requests, 1);
        assert_eq!(fetcher.stats().cache.hits, 1);

        fetcher.clear_cache();
        fetcher.fetch(&request).await.unwrap();
        assert_eq!(fetcher.stats().network_requests, 2);
    }
}
