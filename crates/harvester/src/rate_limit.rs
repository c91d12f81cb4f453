//! Request pacing for the async client.
//!
//! A [`RateLimiter`] enforces a minimum spacing between outgoing requests.
//! The spacing comes from an explicit hourly ceiling, from `x-ratelimit-*`
//! headers observed on earlier responses, or both (the slower one wins).
//! A `retry-after` header on any response holds back every dispatch until
//! the server's deadline passes. An unconfigured limiter never delays.

use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collector::CollectorError;
use crate::http::{HttpHeaders, header_get};

type Gate = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Window that `requests_per_hour` budgets are spread over.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3600);

/// Observed reset times closer than this are treated as this far away.
const MIN_OBSERVED_WINDOW: Duration = Duration::from_secs(1);

/// Longest `retry-after` delay honored.
const MAX_RETRY_AFTER: Duration = RATE_LIMIT_WINDOW;

/// Minimum spacing that keeps `request_count` requests inside `window`.
///
/// A zero window never delays. A zero budget spaces requests by the whole
/// window, so the next request waits for the budget to refill.
#[must_use]
pub fn interval_for(request_count: u32, window: Duration) -> Duration {
    if window.is_zero() {
        return Duration::ZERO;
    }
    match request_count {
        0 => window,
        n => window / n,
    }
}

/// Rate limit state reported by a remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Requests allowed per window.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// When the window resets.
    pub reset_at: DateTime<Utc>,
}

/// Extract rate limit info from `x-ratelimit-*` response headers.
///
/// `x-ratelimit-reset` is read as epoch seconds. Returns `None` when any of
/// the three headers is missing or malformed.
#[must_use]
pub fn parse_rate_limit_headers(headers: &HttpHeaders) -> Option<RateLimitInfo> {
    let limit = header_get(headers, "x-ratelimit-limit")?
        .trim()
        .parse::<u32>()
        .ok()?;
    let remaining = header_get(headers, "x-ratelimit-remaining")?
        .trim()
        .parse::<u32>()
        .ok()?;
    let reset_epoch = header_get(headers, "x-ratelimit-reset")?
        .trim()
        .parse::<i64>()
        .ok()?;
    let reset_at = DateTime::from_timestamp(reset_epoch, 0)?;
    Some(RateLimitInfo {
        limit,
        remaining,
        reset_at,
    })
}

/// Read a `retry-after` header as a delay from `now`.
///
/// Accepts delta-seconds or an HTTP-date. Dates in the past yield zero.
/// Delays are capped at one rate limit window.
#[must_use]
pub fn parse_retry_after(headers: &HttpHeaders, now: DateTime<Utc>) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    let delay = if let Ok(seconds) = value.parse::<u64>() {
        Duration::from_secs(seconds)
    } else {
        let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
        (at - now).to_std().unwrap_or(Duration::ZERO)
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

/// Spacing learned from responses.
#[derive(Debug, Default)]
struct Pacing {
    /// Minimum spacing derived from `x-ratelimit-*` headers.
    observed: Duration,
    /// Slot handed to the most recent dispatch.
    last_dispatch: Option<Instant>,
    /// No dispatch before this instant (`retry-after`).
    hold_until: Option<Instant>,
}

impl Pacing {
    /// Claim the next dispatch slot at or after `now`.
    fn reserve(&mut self, now: Instant) -> Instant {
        let mut slot = now;
        if let Some(last) = self.last_dispatch
            && !self.observed.is_zero()
        {
            slot = slot.max(last + self.observed);
        }
        if let Some(hold) = self.hold_until {
            slot = slot.max(hold);
        }
        self.last_dispatch = Some(slot);
        slot
    }
}

/// Gate that spaces outgoing requests.
pub struct RateLimiter {
    ceiling: Option<Duration>,
    gate: Option<Gate>,
    auto_detect: bool,
    pacing: Mutex<Pacing>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("ceiling", &self.ceiling)
            .field("auto_detect", &self.auto_detect)
            .field("interval", &self.interval())
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RateLimiter {
    /// A limiter that never delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            ceiling: None,
            gate: None,
            auto_detect: false,
            pacing: Mutex::new(Pacing::default()),
        }
    }

    /// Limit to `requests` per hour.
    #[must_use]
    pub fn per_hour(requests: u32) -> Self {
        Self::with_interval(interval_for(requests, RATE_LIMIT_WINDOW))
    }

    /// Enforce a fixed minimum spacing.
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        let gate = Quota::with_period(interval)
            .map(|quota| governor::RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self {
            ceiling: Some(interval),
            gate,
            ..Self::disabled()
        }
    }

    /// A limiter that starts open and paces itself from response headers.
    #[must_use]
    pub fn auto_detect() -> Self {
        Self {
            auto_detect: true,
            ..Self::disabled()
        }
    }

    /// Also adapt to response headers; the configured ceiling stays a floor.
    #[must_use]
    pub fn with_auto_detect(mut self) -> Self {
        self.auto_detect = true;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.ceiling.is_some() || self.auto_detect
    }

    fn pacing(&self) -> std::sync::MutexGuard<'_, Pacing> {
        self.pacing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current minimum spacing between requests.
    #[must_use]
    pub fn interval(&self) -> Duration {
        let observed = self.pacing().observed;
        match self.ceiling {
            Some(ceiling) => observed.max(ceiling),
            None => observed,
        }
    }

    /// Wait until the next request may be dispatched.
    ///
    /// The configured ceiling is enforced first, then the observed spacing
    /// and any pending `retry-after` hold. Returns
    /// [`CollectorError::Cancelled`] as soon as `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), CollectorError> {
        if cancel.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }

        if let Some(gate) = &self.gate {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CollectorError::Cancelled),
                () = gate.until_ready() => {}
            }
        }

        let now = Instant::now();
        let slot = self.pacing().reserve(now);
        if slot <= now {
            return Ok(());
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CollectorError::Cancelled),
            () = tokio::time::sleep_until(slot) => Ok(()),
        }
    }

    /// Hold back every dispatch for at least `delay` from now.
    ///
    /// An earlier hold that ends later is kept.
    pub fn hold_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut pacing = self.pacing();
        if pacing.hold_until.is_none_or(|current| current < until) {
            pacing.hold_until = Some(until);
        }
    }

    /// Feed response headers to the limiter.
    ///
    /// A `retry-after` header is always honored. `x-ratelimit-*` headers
    /// only adjust an auto-detecting limiter. Returns the new interval when
    /// it changed.
    pub fn observe(&self, headers: &HttpHeaders) -> Option<Duration> {
        let now = Utc::now();
        if let Some(delay) = parse_retry_after(headers, now) {
            tracing::debug!(?delay, "Server asked to retry later");
            self.hold_for(delay);
        }
        if !self.auto_detect {
            return None;
        }
        let info = parse_rate_limit_headers(headers)?;
        self.update(&info, now)
    }

    /// Recompute the interval from reported rate limit state.
    ///
    /// The remaining budget is spread over the time left until reset. The
    /// new spacing applies from the most recent dispatch, so a request that
    /// follows a change still waits.
    pub fn update(&self, info: &RateLimitInfo, now: DateTime<Utc>) -> Option<Duration> {
        let window = (info.reset_at - now)
            .to_std()
            .unwrap_or(MIN_OBSERVED_WINDOW)
            .max(MIN_OBSERVED_WINDOW);
        let observed = interval_for(info.remaining, window);

        let floor = self.ceiling.unwrap_or_default();
        let previous = std::mem::replace(&mut self.pacing().observed, observed);
        let interval = observed.max(floor);
        if interval == previous.max(floor) {
            return None;
        }
        tracing::debug!(
            limit = info.limit,
            remaining = info.remaining,
            ?interval,
            "Adjusting request interval from rate limit headers"
        );
        Some(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn headers(limit: &str, remaining: &str, reset: &str) -> HttpHeaders {
        vec![
            ("X-RateLimit-Limit".to_string(), limit.to_string()),
            ("X-RateLimit-Remaining".to_string(), remaining.to_string()),
            ("X-RateLimit-Reset".to_string(), reset.to_string()),
        ]
    }

    #[test]
    fn interval_for_spreads_budget_over_window() {
        assert_eq!(
            interval_for(3600, Duration::from_secs(3600)),
            Duration::from_secs(1)
        );
        assert_eq!(
            interval_for(18_000, RATE_LIMIT_WINDOW),
            Duration::from_millis(200)
        );
        assert_eq!(
            interval_for(0, Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        assert_eq!(interval_for(10, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn parse_headers_reads_all_three_values() {
        let info = parse_rate_limit_headers(&headers("5000", "4999", "1700000000")).unwrap();
        assert_eq!(info.limit, 5000);
        assert_eq!(info.remaining, 4999);
        assert_eq!(info.reset_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn parse_headers_rejects_partial_or_malformed_sets() {
        let mut partial = headers("5000", "4999", "1700000000");
        partial.pop();
        assert!(parse_rate_limit_headers(&partial).is_none());
        assert!(parse_rate_limit_headers(&headers("lots", "1", "1700000000")).is_none());
    }

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = RateLimiter::disabled();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..50 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(!limiter.is_enabled());
    }

    #[tokio::test]
    async fn fixed_interval_spaces_requests() {
        let limiter = RateLimiter::with_interval(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait(&cancel).await.unwrap();
        }
        // First request is immediate, the next two wait one interval each.
        assert!(
            start.elapsed() >= Duration::from_millis(90),
            "elapsed {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let limiter = RateLimiter::per_hour(1);
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = limiter.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, CollectorError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn update_spreads_remaining_over_time_to_reset() {
        let limiter = RateLimiter::auto_detect();
        let now = Utc::now();
        let info = RateLimitInfo {
            limit: 5000,
            remaining: 100,
            reset_at: now + chrono::Duration::seconds(100),
        };
        assert_eq!(limiter.update(&info, now), Some(Duration::from_secs(1)));
        assert_eq!(limiter.interval(), Duration::from_secs(1));
        // Same state again is not a change.
        assert_eq!(limiter.update(&info, now), None);
    }

    #[test]
    fn configured_ceiling_is_a_floor_for_observed_rates() {
        let limiter = RateLimiter::with_interval(Duration::from_secs(2)).with_auto_detect();
        let now = Utc::now();
        let generous = RateLimitInfo {
            limit: 5000,
            remaining: 5000,
            reset_at: now + chrono::Duration::seconds(100),
        };
        limiter.update(&generous, now);
        assert_eq!(limiter.interval(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_holds_across_interval_changes() {
        let limiter = RateLimiter::auto_detect();
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        for i in 0..5 {
            limiter.wait(&cancel).await.unwrap();
            let now = Utc::now();
            let info = RateLimitInfo {
                limit: 10,
                remaining: 10 - i,
                reset_at: now + chrono::Duration::seconds(10),
            };
            assert!(limiter.update(&info, now).is_some());
        }
        // Four gaps of at least one second each (10s / 10, 10s / 9, ...).
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn ceiling_keeps_pacing_while_headers_arrive() {
        let limiter = RateLimiter::with_interval(Duration::from_millis(50)).with_auto_detect();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait(&cancel).await.unwrap();
            let now = Utc::now();
            limiter.update(
                &RateLimitInfo {
                    limit: 5000,
                    remaining: 5000,
                    reset_at: now + chrono::Duration::seconds(60),
                },
                now,
            );
        }
        assert!(
            start.elapsed() >= Duration::from_millis(90),
            "elapsed {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let header = |value: &str| vec![("Retry-After".to_string(), value.to_string())];

        assert_eq!(
            parse_retry_after(&header("120"), now),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            parse_retry_after(&header("Wed, 21 Oct 2026 07:28:30 GMT"), now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after(&header("Wed, 21 Oct 2026 07:00:00 GMT"), now),
            Some(Duration::ZERO)
        );
        assert_eq!(
            parse_retry_after(&header("999999"), now),
            Some(RATE_LIMIT_WINDOW)
        );
        assert_eq!(parse_retry_after(&header("soon"), now), None);
        assert_eq!(parse_retry_after(&Vec::new(), now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_holds_back_next_dispatch() {
        let limiter = RateLimiter::disabled();
        let cancel = CancellationToken::new();
        limiter.observe(&vec![("Retry-After".to_string(), "3".to_string())]);

        let start = tokio::time::Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));

        // The hold is spent; later dispatches go straight through.
        let after = tokio::time::Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert_eq!(after.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_retry_after_hold() {
        let limiter = RateLimiter::disabled();
        let cancel = CancellationToken::new();
        limiter.hold_for(Duration::from_secs(600));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = limiter.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, CollectorError::Cancelled));
    }

    #[test]
    fn observe_is_ignored_without_auto_detect() {
        let limiter = RateLimiter::per_hour(3600);
        let reset = (Utc::now().timestamp() + 10).to_string();
        assert_eq!(limiter.observe(&headers("10", "1", &reset)), None);
        assert_eq!(limiter.interval(), Duration::from_secs(1));
    }
}
