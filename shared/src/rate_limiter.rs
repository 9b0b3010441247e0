use governor::{Quota, RateLimiter as GovernorRateLimiter};
use nonzero_ext::nonzero;
use rand::{thread_rng, Rng};
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Classification of a failed attempt, telling `execute_with_retry` whether
/// and how long to wait before trying again. The wrapped error is handed back
/// untouched once retries are exhausted.
#[derive(Debug)]
pub enum RetryableError<E> {
    /// Upstream rate limit (HTTP 429) with a server-specified wait duration.
    RateLimited { retry_after: Duration, error: E },
    /// Retried with exponential backoff plus jitter.
    Transient(E),
    /// Returned immediately.
    Permanent(E),
}

impl<E> RetryableError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::RateLimited { error, .. } => error,
            Self::Transient(error) => error,
            Self::Permanent(error) => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryableError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after, error } => {
                write!(f, "Rate limited: {} (retry after {:?})", error, retry_after)
            }
            Self::Transient(e) => write!(f, "{}", e),
            Self::Permanent(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryableError<E> {}

type DirectLimiter = GovernorRateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Clone)]
pub struct RateLimiter {
    limiter: Arc<DirectLimiter>,
    max_retries: u32,
    base_delay: Duration,
    request_count: Arc<AtomicU64>,
    last_log_time: Arc<Mutex<Instant>>,
    configured_rps: u32,
}

impl RateLimiter {
    const MAX_BACKOFF: Duration = Duration::from_secs(32);

    pub fn new(requests_per_second: u32, max_retries: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
        let limiter = Arc::new(GovernorRateLimiter::direct(Quota::per_second(rps)));

        debug!(
            "Creating rate limit with limit of {} requests per second",
            rps
        );
        Self {
            limiter,
            max_retries,
            base_delay: Duration::from_secs(1),
            request_count: Arc::new(AtomicU64::new(0)),
            last_log_time: Arc::new(Mutex::new(Instant::now())),
            configured_rps: rps.get(),
        }
    }

    /// First backoff step for transient failures; doubles on each retry.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn check_rate_limit(&self) {
        self.limiter.until_ready().await;

        self.request_count.fetch_add(1, Ordering::Relaxed);

        // A poisoned stats lock only loses a log line.
        let Ok(mut last_log) = self.last_log_time.lock() else {
            return;
        };
        let elapsed = last_log.elapsed();

        if elapsed >= Duration::from_secs(1) {
            let count = self.request_count.swap(0, Ordering::Relaxed);
            let actual_rps = count as f64 / elapsed.as_secs_f64();

            debug!(
                "Rate limiter stats: actual={:.2} req/sec, limit={} req/sec",
                actual_rps, self.configured_rps
            );

            *last_log = Instant::now();
        }
    }

    pub async fn execute_with_retry<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RetryableError<E>>>,
    {
        let mut retries = 0;
        let mut delay = self.base_delay;

        loop {
            self.check_rate_limit().await;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(RetryableError::Permanent(e)) => return Err(e),
                Err(RetryableError::RateLimited { retry_after, error }) => {
                    if retries >= self.max_retries {
                        return Err(error);
                    }
                    retries += 1;
                    warn!(
                        "Rate limited: {}, retry {} of {}, waiting {:?}",
                        error, retries, self.max_retries, retry_after
                    );
                    sleep(retry_after).await;
                }
                Err(RetryableError::Transient(e)) => {
                    if retries >= self.max_retries {
                        return Err(e);
                    }
                    retries += 1;
                    let jitter_ceiling = (self.base_delay.as_millis() as u64).max(1);
                    let jitter = thread_rng().gen_range(0..jitter_ceiling);
                    let wait_time = delay + Duration::from_millis(jitter);
                    warn!(
                        "Transient error: {}, retry {} of {}, waiting {:?}",
                        e, retries, self.max_retries, wait_time
                    );
                    sleep(wait_time).await;
                    delay = delay.saturating_mul(2).min(Self::MAX_BACKOFF);
                }
            }
        }
    }

    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check_rate_limit().await;
        operation().await
    }
}
