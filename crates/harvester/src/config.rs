//! Collector tuning shared by every plugin.
//!
//! These values are usually loaded from the surrounding application's config
//! file; every field has a default so a partial section is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::{RATE_LIMIT_WINDOW, RateLimiter};
use crate::retry::RetryConfig;

/// Default number of records requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Default number of fan-out items collected in parallel.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default size of the async client's worker pool.
pub const DEFAULT_WORKERS: usize = 5;

/// Upper bound for the derived worker pool size.
pub const MAX_WORKERS: usize = 100;

/// Default number of retries for transient request failures.
pub const DEFAULT_RETRIES: usize = 3;

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// One worker is provisioned for every this-many seconds of the rate window.
const SECONDS_PER_WORKER_SLOT: u64 = 5;

/// Collector and async client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Records requested per page.
    pub page_size: u32,
    /// Fan-out items processed concurrently.
    pub concurrency: usize,
    /// Async client worker pool size. Derived from the rate when unset.
    pub workers: Option<usize>,
    /// Explicit request ceiling per hour.
    pub requests_per_hour: Option<u32>,
    /// Adapt the request interval to `x-ratelimit-*` response headers.
    pub auto_detect_rate_limit: bool,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retries for transport errors, 429 and 5xx responses.
    pub max_retries: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            workers: None,
            requests_per_hour: None,
            auto_detect_rate_limit: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_RETRIES,
        }
    }
}

impl CollectorConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Worker pool size for the async client.
    ///
    /// With a known hourly budget the pool gets one worker per five-second
    /// slot's worth of requests, so slow responses do not starve the budget.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if let Some(workers) = self.workers {
            return workers.clamp(1, MAX_WORKERS);
        }
        match self.requests_per_hour {
            Some(requests) => {
                let slots = RATE_LIMIT_WINDOW.as_secs() / SECONDS_PER_WORKER_SLOT;
                let workers = u64::from(requests) / slots;
                usize::try_from(workers)
                    .unwrap_or(MAX_WORKERS)
                    .clamp(1, MAX_WORKERS)
            }
            None => DEFAULT_WORKERS,
        }
    }

    /// Build the rate limiter described by this configuration.
    #[must_use]
    pub fn rate_limiter(&self) -> RateLimiter {
        match (self.requests_per_hour, self.auto_detect_rate_limit) {
            (Some(requests), true) => RateLimiter::per_hour(requests).with_auto_detect(),
            (Some(requests), false) => RateLimiter::per_hour(requests),
            (None, true) => RateLimiter::auto_detect(),
            (None, false) => RateLimiter::disabled(),
        }
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        }
    }
}
