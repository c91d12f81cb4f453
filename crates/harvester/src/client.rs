//! Rate-limited HTTP client backed by a fixed worker pool.
//!
//! Requests are queued on a bounded channel and executed by `workers` tasks.
//! Each worker waits on the shared [`RateLimiter`] before dispatching,
//! retries transient failures, then runs the caller's [`AfterResponse`] hook
//! to decide whether the response is usable.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collector::CollectorError;
use crate::config::{CollectorConfig, DEFAULT_WORKERS};
use crate::http::{HttpHeaders, HttpRequest, HttpResponse, HttpTransport};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryConfig, with_retry};

/// Pending requests buffered per worker before `enqueue` applies backpressure.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

/// How a response should be treated once it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Parse the body and keep paginating.
    Continue,
    /// Drop the remaining pages of the current item without failing the run.
    Skip,
}

/// Classifies a response before its body is parsed.
///
/// Returning `Err` aborts the whole collection run.
pub trait AfterResponse: Send + Sync {
    fn classify(&self, response: &HttpResponse, url: &str)
    -> Result<ResponseAction, CollectorError>;
}

impl<F> AfterResponse for F
where
    F: Fn(&HttpResponse, &str) -> Result<ResponseAction, CollectorError> + Send + Sync,
{
    fn classify(
        &self,
        response: &HttpResponse,
        url: &str,
    ) -> Result<ResponseAction, CollectorError> {
        self(response, url)
    }
}

/// 2xx continues, 401/403 is an authentication failure, anything else is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAfterResponse;

impl AfterResponse for DefaultAfterResponse {
    fn classify(
        &self,
        response: &HttpResponse,
        url: &str,
    ) -> Result<ResponseAction, CollectorError> {
        match response.status {
            200..=299 => Ok(ResponseAction::Continue),
            401 | 403 => Err(CollectorError::Unauthorized {
                status: response.status,
                url: url.to_string(),
            }),
            status => Err(CollectorError::status(status, url, &response.body)),
        }
    }
}

/// Like [`DefaultAfterResponse`] but skips items whose endpoint returns 404.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreNotFound;

impl AfterResponse for IgnoreNotFound {
    fn classify(
        &self,
        response: &HttpResponse,
        url: &str,
    ) -> Result<ResponseAction, CollectorError> {
        if response.status == 404 {
            tracing::debug!(url, "Ignoring 404 response");
            return Ok(ResponseAction::Skip);
        }
        DefaultAfterResponse.classify(response, url)
    }
}

/// A response together with its classification.
#[derive(Debug, Clone)]
pub enum Classified {
    Continue(HttpResponse),
    Skip(HttpResponse),
}

impl Classified {
    #[must_use]
    pub fn response(&self) -> &HttpResponse {
        match self {
            Self::Continue(response) | Self::Skip(response) => response,
        }
    }
}

struct Job {
    request: HttpRequest,
    hook: Arc<dyn AfterResponse>,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<Classified, CollectorError>>,
}

struct WorkerContext {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
}

impl WorkerContext {
    async fn run(&self, id: usize, queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
        loop {
            let job = {
                let mut queue = queue.lock().await;
                queue.recv().await
            };
            let Some(job) = job else {
                tracing::trace!(worker = id, "Request queue closed");
                break;
            };
            if job.reply.is_closed() {
                continue;
            }
            let result = self.dispatch(job.request, job.hook.as_ref(), &job.cancel).await;
            // The caller may have stopped waiting; nothing to do then.
            let _ = job.reply.send(result);
        }
    }

    async fn dispatch(
        &self,
        request: HttpRequest,
        hook: &dyn AfterResponse,
        cancel: &CancellationToken,
    ) -> Result<Classified, CollectorError> {
        let url = request.url.clone();
        let (request, url_ref) = (&request, url.as_str());
        let attempt = || async move {
            self.limiter.wait(cancel).await?;
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CollectorError::Cancelled),
                sent = self.transport.send(request.clone()) => sent?,
            };
            self.limiter.observe(&response.headers);
            if response.status == 429 || response.status >= 500 {
                return Err(CollectorError::status(response.status, url_ref, &response.body));
            }
            Ok(response)
        };

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CollectorError::Cancelled),
            result = with_retry(attempt, &self.retry, CollectorError::is_transient, &url) => result?,
        };

        tracing::debug!(status = response.status, %url, "Received response");
        match hook.classify(&response, &url)? {
            ResponseAction::Continue => Ok(Classified::Continue(response)),
            ResponseAction::Skip => Ok(Classified::Skip(response)),
        }
    }
}

/// Builder for [`AsyncClient`].
pub struct AsyncClientBuilder {
    transport: Arc<dyn HttpTransport>,
    base_url: Option<String>,
    headers: HttpHeaders,
    workers: usize,
    limiter: RateLimiter,
    retry: RetryConfig,
    after_response: Arc<dyn AfterResponse>,
}

impl AsyncClientBuilder {
    /// Prefix for request URLs that are not absolute.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Header sent with every request (e.g. `Authorization`).
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Hook used by [`AsyncClient::enqueue`].
    #[must_use]
    pub fn after_response(mut self, hook: impl AfterResponse + 'static) -> Self {
        self.after_response = Arc::new(hook);
        self
    }

    /// Apply pool size, pacing and retry settings from `config`.
    #[must_use]
    pub fn config(self, config: &CollectorConfig) -> Self {
        self.workers(config.worker_count())
            .rate_limiter(config.rate_limiter())
            .retry(config.retry_config())
    }

    /// Spawn the worker pool. Must be called inside a tokio runtime.
    #[must_use]
    pub fn build(self) -> AsyncClient {
        let (sender, receiver) = mpsc::channel(self.workers * QUEUE_DEPTH_PER_WORKER);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let context = Arc::new(WorkerContext {
            transport: self.transport,
            limiter: Arc::new(self.limiter),
            retry: self.retry,
        });

        let handles = (0..self.workers)
            .map(|id| {
                let context = Arc::clone(&context);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move { context.run(id, receiver).await })
            })
            .collect();

        tracing::debug!(workers = self.workers, "Started async client");

        AsyncClient {
            base_url: self.base_url.map(|b| b.trim_end_matches('/').to_string()),
            headers: self.headers,
            after_response: self.after_response,
            sender: Mutex::new(Some(sender)),
            handles: tokio::sync::Mutex::new(handles),
            limiter: Arc::clone(&context.limiter),
            workers: self.workers,
        }
    }
}

/// Queue-backed HTTP client shared by every worker of a collection run.
pub struct AsyncClient {
    base_url: Option<String>,
    headers: HttpHeaders,
    after_response: Arc<dyn AfterResponse>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    limiter: Arc<RateLimiter>,
    workers: usize,
}

impl AsyncClient {
    #[must_use]
    pub fn builder(transport: Arc<dyn HttpTransport>) -> AsyncClientBuilder {
        AsyncClientBuilder {
            transport,
            base_url: None,
            headers: Vec::new(),
            workers: DEFAULT_WORKERS,
            limiter: RateLimiter::disabled(),
            retry: RetryConfig::default(),
            after_response: Arc::new(DefaultAfterResponse),
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Queue a request and wait for its classified response.
    pub async fn enqueue(&self, request: HttpRequest) -> Result<Classified, CollectorError> {
        self.enqueue_with(
            request,
            Arc::clone(&self.after_response),
            &CancellationToken::new(),
        )
        .await
    }

    /// Queue a request with an explicit response hook and cancellation token.
    pub async fn enqueue_with(
        &self,
        request: HttpRequest,
        hook: Arc<dyn AfterResponse>,
        cancel: &CancellationToken,
    ) -> Result<Classified, CollectorError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CollectorError::Released)?;

        let (reply, response) = oneshot::channel();
        let job = Job {
            request: self.prepare(request),
            hook,
            cancel: cancel.clone(),
            reply,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CollectorError::Cancelled),
            sent = sender.send(job) => sent.map_err(|_| CollectorError::Released)?,
        }
        drop(sender);

        response.await.map_err(|_| CollectorError::Released)?
    }

    /// Stop accepting requests, let queued ones finish and wait for workers.
    pub async fn release(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Async client worker ended abnormally: {}", e);
            }
        }
    }

    /// The default response hook.
    #[must_use]
    pub fn after_response(&self) -> Arc<dyn AfterResponse> {
        Arc::clone(&self.after_response)
    }

    fn prepare(&self, mut request: HttpRequest) -> HttpRequest {
        if let Some(base) = &self.base_url
            && !request.url.starts_with("http://")
            && !request.url.starts_with("https://")
        {
            request.url = format!("{}/{}", base, request.url.trim_start_matches('/'));
        }
        for (name, value) in &self.headers {
            if crate::http::header_get(&request.headers, name).is_none() {
                request.headers.push((name.clone(), value.clone()));
            }
        }
        request
    }
}
