// File: src/rate_limiter.rs

use crate::config::UpstreamSettings;
use crate::errors::UpstreamError;
use crate::metrics::{RPC_LATENCY_HISTOGRAM, RPC_RETRIES_COUNTER, RPC_TIMEOUTS_COUNTER};
use futures::Future;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

const RATE_LIMIT_ERRORS: &[&str] = &[
    "rate limit",
    "too many requests",
    "exceeded",
    "429",
    "-32005",
];

const RATE_LIMIT_WAIT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default)]
pub struct UpstreamCallMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub rate_limited_calls: u64,
    pub timed_out_calls: u64,
    pub failed_calls: u64,
    pub total_wait_time_ms: u64,
}

/// Builds the process-wide limiter that every source shares, so two sources
/// backfilling at once still respect one request budget.
pub fn global_rate_limiter(settings: &UpstreamSettings) -> Arc<DefaultDirectRateLimiter> {
    let rps = NonZeroU32::new(settings.default_rps_limit.saturating_mul(4).max(1))
        .unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(settings.rate_limit_burst_size.max(1)).unwrap_or(NonZeroU32::MIN);
    Arc::new(GovernorRateLimiter::direct(Quota::per_second(rps).allow_burst(burst)))
}

/// Rate limiter and retry wrapper for one upstream source. Every call funnels
/// through `execute`, which enforces the concurrency cap, the request budget,
/// the per-call deadline, and exponential backoff on transient failures.
#[derive(Debug)]
pub struct SourceRateLimiter {
    source: String,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    global_limiter: Arc<DefaultDirectRateLimiter>,
    concurrency_limiter: Option<Arc<Semaphore>>,
    metrics: Arc<RwLock<UpstreamCallMetrics>>,
    settings: Arc<UpstreamSettings>,
    deadline: Duration,
}

impl SourceRateLimiter {
    pub fn new(
        source: &str,
        rps_limit: Option<u32>,
        max_concurrent: Option<u32>,
        global_limiter: Arc<DefaultDirectRateLimiter>,
        settings: Arc<UpstreamSettings>,
    ) -> Self {
        let base_rps_limit = rps_limit.unwrap_or(settings.default_rps_limit);
        let max_concurrent = max_concurrent
            .unwrap_or(settings.default_max_concurrent_requests)
            .min(50);

        let quota = Quota::per_second(
            NonZeroU32::new(base_rps_limit)
                .unwrap_or_else(|| NonZeroU32::new(settings.default_rps_limit.max(1)).unwrap_or(NonZeroU32::MIN)),
        )
        .allow_burst(
            NonZeroU32::new(settings.rate_limit_burst_size)
                .unwrap_or_else(|| NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN)),
        );

        let rate_limiter = Arc::new(GovernorRateLimiter::direct(quota));
        let concurrency_limiter = if max_concurrent > 0 {
            Some(Arc::new(Semaphore::new(max_concurrent as usize)))
        } else {
            None
        };

        debug!(
            source = source,
            rps_limit = base_rps_limit,
            max_concurrent = max_concurrent,
            "Initialized source rate limiter"
        );

        let deadline = Duration::from_millis(settings.rpc_timeout_ms);
        Self {
            source: source.to_string(),
            rate_limiter,
            global_limiter,
            concurrency_limiter,
            metrics: Arc::new(RwLock::new(UpstreamCallMetrics::default())),
            settings,
            deadline,
        }
    }

    /// Overrides the per-call deadline. Chain RPC keeps the tight default;
    /// indexer HTTP calls get the longer HTTP budget.
    pub fn with_deadline(mut self, deadline_ms: u64) -> Self {
        self.deadline = Duration::from_millis(deadline_ms);
        self
    }

    pub async fn metrics(&self) -> UpstreamCallMetrics {
        self.metrics.read().await.clone()
    }

    async fn wait_on_limiter(
        &self,
        limiter: &DefaultDirectRateLimiter,
        limiter_name: &str,
        method_name: &str,
    ) -> Result<(), UpstreamError> {
        let wait_start = Instant::now();
        match timeout(
            Duration::from_secs(RATE_LIMIT_WAIT_TIMEOUT_SECS),
            limiter.until_ready(),
        )
        .await
        {
            Ok(_) => {
                let wait_time = wait_start.elapsed();
                if wait_time.as_millis() > 1000 {
                    debug!(
                        source = %self.source,
                        method = method_name,
                        limiter = limiter_name,
                        wait_ms = wait_time.as_millis(),
                        "Long rate limit wait detected"
                    );
                }
                Ok(())
            }
            Err(_) => {
                let mut metrics = self.metrics.write().await;
                metrics.rate_limited_calls += 1;
                Err(UpstreamError::RateLimited(format!(
                    "{} timeout after {} seconds",
                    limiter_name, RATE_LIMIT_WAIT_TIMEOUT_SECS
                )))
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.initial_backoff_ms as f64
            * self.settings.backoff_multiplier.powf(attempt.saturating_sub(1) as f64);
        let jitter = rand::thread_rng().gen_range(0.0..1.0)
            * self.settings.jitter_factor
            * self.settings.initial_backoff_ms as f64;
        let total = (base + jitter) as u64;
        Duration::from_millis(total.min(self.settings.max_backoff_ms))
    }

    /// Runs `call_fn` under the limiter with up to `max_retries` attempts.
    /// Transient errors back off exponentially with jitter; a call that
    /// exceeds the per-call deadline surfaces as `UpstreamError::Timeout`
    /// so callers can tell a slow node from a broken one.
    pub async fn execute<F, Fut, T>(&self, method_name: &str, call_fn: F) -> Result<T, UpstreamError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let start_time = Instant::now();
        {
            let mut metrics = self.metrics.write().await;
            metrics.total_calls += 1;
        }

        let _permit = if let Some(ref sem) = self.concurrency_limiter {
            Some(
                sem.acquire()
                    .await
                    .map_err(|_| UpstreamError::Other("Concurrency semaphore closed".to_string()))?,
            )
        } else {
            None
        };

        self.wait_on_limiter(&self.global_limiter, "Global rate limiter", method_name)
            .await?;
        self.wait_on_limiter(&self.rate_limiter, "Per-source rate limiter", method_name)
            .await?;

        let deadline = self.deadline;
        let mut attempt = 0;
        let mut last_error: Option<UpstreamError> = None;

        while attempt < self.settings.max_retries {
            if attempt > 0 {
                RPC_RETRIES_COUNTER.with_label_values(&[method_name]).inc();
            }
            attempt += 1;

            trace!(
                source = %self.source,
                method = method_name,
                attempt = attempt,
                "Executing upstream call"
            );

            let error = match timeout(deadline, call_fn()).await {
                Ok(Ok(result)) => {
                    let total_time = start_time.elapsed();
                    let mut metrics = self.metrics.write().await;
                    metrics.successful_calls += 1;
                    metrics.total_wait_time_ms += total_time.as_millis() as u64;
                    RPC_LATENCY_HISTOGRAM
                        .with_label_values(&[method_name])
                        .observe(total_time.as_secs_f64());
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    if is_rate_limit_error(&e) {
                        let mut metrics = self.metrics.write().await;
                        metrics.rate_limited_calls += 1;
                    }
                    e
                }
                Err(_) => {
                    RPC_TIMEOUTS_COUNTER.with_label_values(&[method_name]).inc();
                    let mut metrics = self.metrics.write().await;
                    metrics.timed_out_calls += 1;
                    UpstreamError::Timeout {
                        elapsed_ms: deadline.as_millis() as u64,
                    }
                }
            };

            if error.is_retryable() && attempt < self.settings.max_retries {
                let delay = self.backoff_delay(attempt);
                warn!(
                    source = %self.source,
                    method = method_name,
                    attempt = attempt,
                    error = %error,
                    backoff_ms = delay.as_millis(),
                    "Transient upstream error, retrying with backoff"
                );
                last_error = Some(error);
                sleep(delay).await;
                continue;
            }

            debug!(
                source = %self.source,
                method = method_name,
                attempt = attempt,
                error = %error,
                "Upstream call failed (non-retryable or max attempts)"
            );
            let mut metrics = self.metrics.write().await;
            metrics.failed_calls += 1;
            return Err(error);
        }

        let mut metrics = self.metrics.write().await;
        metrics.failed_calls += 1;
        Err(last_error.unwrap_or_else(|| {
            UpstreamError::Other(format!("{} failed with no recorded error", method_name))
        }))
    }
}

/// Providers signal throttling through error strings rather than a typed
/// code, so classification is substring matching.
fn is_rate_limit_error(error: &UpstreamError) -> bool {
    match error {
        UpstreamError::RateLimited(_) => true,
        UpstreamError::Http { status, .. } => *status == 429,
        other => {
            let msg = other.to_string().to_lowercase();
            RATE_LIMIT_ERRORS.iter().any(|pattern| msg.contains(pattern))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_settings() -> Arc<UpstreamSettings> {
        Arc::new(UpstreamSettings {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            rpc_timeout_ms: 200,
            ..UpstreamSettings::default()
        })
    }

    fn test_limiter(settings: Arc<UpstreamSettings>) -> SourceRateLimiter {
        let global = global_rate_limiter(&settings);
        SourceRateLimiter::new("test", Some(1000), Some(8), global, settings)
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let limiter = test_limiter(test_settings());
        let result = limiter.execute("probe", || async { Ok::<_, UpstreamError>(7u64) }).await;
        assert_eq!(result.unwrap(), 7);
        let metrics = limiter.metrics().await;
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.successful_calls, 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let limiter = test_limiter(test_settings());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = limiter
            .execute("probe", move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(UpstreamError::Rpc("connection reset".to_string()))
                    } else {
                        Ok(42u64)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let limiter = test_limiter(test_settings());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<u64, _> = limiter
            .execute("probe", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::Rpc("connection reset".to_string()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let limiter = test_limiter(test_settings());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<u64, _> = limiter
            .execute("probe", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::Decode("bad topic".to_string()))
                }
            })
            .await;
        assert!(matches!(result, Err(UpstreamError::Decode(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_surface_as_timeouts() {
        let limiter = test_limiter(test_settings());
        let result: Result<u64, _> = limiter
            .execute("probe", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1u64)
            })
            .await;
        assert!(matches!(result, Err(UpstreamError::Timeout { .. })));
        let metrics = limiter.metrics().await;
        assert_eq!(metrics.timed_out_calls, 3);
    }
}
