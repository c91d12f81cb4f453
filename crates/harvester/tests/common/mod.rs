//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvester::retry::RetryConfig;
use harvester::{AsyncClient, HttpError, HttpRequest, HttpResponse, HttpTransport, RateLimiter};
use sea_orm::{Database, DatabaseConnection};

pub const BASE_URL: &str = "https://api.test";

/// Maximum time any collection should take in tests.
/// If exceeded, there's likely a hang/deadlock.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(10);

/// Scripted transport keyed by full URL, tracking concurrent requests.
#[derive(Clone, Default)]
pub struct FixtureTransport {
    inner: Arc<FixtureInner>,
}

#[derive(Default)]
struct FixtureInner {
    routes: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<String>>,
    sent: Mutex<Vec<(tokio::time::Instant, HttpRequest)>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every response for `delay` before returning it.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock().unwrap() = delay;
        self
    }

    /// Queue a response for a path relative to [`BASE_URL`].
    pub fn respond(&self, path: &str, response: HttpResponse) {
        self.inner
            .routes
            .lock()
            .unwrap()
            .entry(format!("{BASE_URL}/{path}"))
            .or_default()
            .push_back(response);
    }

    /// Queue a 200 response with a JSON body.
    pub fn respond_json(&self, path: &str, body: serde_json::Value) {
        self.respond(path, HttpResponse::new(200, body.to_string()));
    }

    pub fn requests(&self) -> Vec<String> {
        self.inner.requests.lock().unwrap().clone()
    }

    /// Full requests in arrival order.
    pub fn sent(&self) -> Vec<HttpRequest> {
        let sent = self.inner.sent.lock().unwrap();
        sent.iter().map(|(_, request)| request.clone()).collect()
    }

    /// Gaps between consecutive requests reaching the transport.
    pub fn gaps(&self) -> Vec<Duration> {
        let sent = self.inner.sent.lock().unwrap();
        sent.windows(2).map(|pair| pair[1].0 - pair[0].0).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for FixtureTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let current = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.inner.requests.lock().unwrap().push(request.url.clone());
        self.inner
            .sent
            .lock()
            .unwrap()
            .push((tokio::time::Instant::now(), request.clone()));

        let delay = *self.inner.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self
            .inner
            .routes
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front);
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);

        response.ok_or(HttpError::NoMockResponse {
            method: request.method.as_str().to_string(),
            url: request.url,
        })
    }
}

/// Client over `transport` pacing requests with `limiter`, no retries.
pub fn paced_client(
    transport: &FixtureTransport,
    workers: usize,
    limiter: RateLimiter,
) -> Arc<AsyncClient> {
    Arc::new(
        AsyncClient::builder(Arc::new(transport.clone()))
            .base_url(BASE_URL)
            .workers(workers)
            .rate_limiter(limiter)
            .retry(RetryConfig::none())
            .build(),
    )
}

/// Client over `transport` with no pacing and no retries.
pub fn client(transport: &FixtureTransport, workers: usize) -> Arc<AsyncClient> {
    Arc::new(
        AsyncClient::builder(Arc::new(transport.clone()))
            .base_url(BASE_URL)
            .workers(workers)
            .retry(RetryConfig::none())
            .build(),
    )
}

pub async fn memory_db() -> DatabaseConnection {
    Database::connect("sqlite::memory:")
        .await
        .expect("Failed to create test database")
}

/// `n` JSON records `{"id": start..start+n}`.
pub fn records(start: usize, n: usize) -> serde_json::Value {
    serde_json::Value::Array(
        (start..start + n)
            .map(|id| serde_json::json!({ "id": id }))
            .collect(),
    )
}
