//! Per-source token buckets and the retry/backoff policy wrapped around every
//! connector call.
//!
//! A [`RateLimiter`] is created per run and shared (via `Arc`) by every
//! concurrent call, so budgets reset between scheduled runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SourceError;

/// Request budget for one upstream API. Capacity is at least one request and
/// the period at least one millisecond, so a bucket always refills.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSpec {
    capacity: u32,
    period: Duration,
}

impl BudgetSpec {
    pub const fn new(capacity: u32, period: Duration) -> Self {
        let capacity = if capacity == 0 { 1 } else { capacity };
        let period = if period.as_millis() == 0 {
            Duration::from_millis(1)
        } else {
            period
        };
        Self { capacity, period }
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub const fn period(&self) -> Duration {
        self.period
    }

    pub const fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    pub const fn per_day(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(86_400))
    }

    /// Effectively unlimited; used by the synthetic source.
    pub const fn unlimited() -> Self {
        Self::new(u32::MAX, Duration::from_secs(1))
    }

    fn refill_per_sec(&self) -> f64 {
        f64::from(self.capacity) / self.period.as_secs_f64()
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl Bucket {
    fn new(budget: BudgetSpec, now: Instant) -> Self {
        Self {
            tokens: budget.capacity as f64,
            capacity: budget.capacity as f64,
            refill_per_sec: budget.refill_per_sec(),
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::try_from_secs_f64(missing / self.refill_per_sec).unwrap_or(Duration::MAX))
    }
}

/// Shared token buckets keyed by source tag.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Wait for a token from `source`'s bucket. Fails with `RateLimited` when
    /// the next token would arrive later than `max_wait`.
    pub async fn acquire(
        &self,
        source: &str,
        budget: BudgetSpec,
        max_wait: Duration,
    ) -> Result<(), SourceError> {
        let deadline = Instant::now().checked_add(max_wait);
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                let bucket = buckets
                    .entry(source.to_string())
                    .or_insert_with(|| Bucket::new(budget, now));
                match bucket.try_take(now) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };
            let ready_at = Instant::now().checked_add(wait);
            if ready_at.zip(deadline).map_or(true, |(ready, end)| ready > end) {
                return Err(SourceError::RateLimited {
                    retry_after: Some(wait),
                });
            }
            debug!(source, wait_ms = wait.as_millis() as u64, "waiting for rate budget");
            tokio::time::sleep(wait).await;
        }
    }

    /// Remaining whole tokens for a source, if it has been used this run.
    #[cfg(test)]
    async fn remaining(&self, source: &str) -> Option<u32> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.get_mut(source)?;
        bucket.refill(Instant::now());
        Some(bucket.tokens.floor() as u32)
    }
}

/// Exponential backoff with jitter, bounded by attempts and an overall budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total wall time a single call may spend across all attempts.
    pub budget: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            budget: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let base = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as u64 / 4;
        let extra = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(extra)).min(self.max_delay)
    }

    /// Run `op`, retrying retryable failures. Upstream `Retry-After` hints
    /// stretch the delay; a delay that would overrun the budget ends the loop
    /// with the last error.
    pub async fn run<T, F, Fut>(&self, source: &str, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let deadline = Instant::now() + self.budget;
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= self.max_retries {
                return Err(err);
            }
            let mut delay = self.backoff(attempt);
            if let SourceError::RateLimited {
                retry_after: Some(hint),
            } = &err
            {
                delay = delay.max(*hint);
            }
            if Instant::now() + delay > deadline {
                warn!(source, attempt, error = %err, "retry budget exhausted");
                return Err(err);
            }
            attempt += 1;
            warn!(
                source,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying source call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Handle injected into a connector: the run's shared limiter, the source's
/// budget and the retry policy.
#[derive(Debug, Clone)]
pub struct SourceGate {
    source: &'static str,
    limiter: Arc<RateLimiter>,
    budget: BudgetSpec,
    policy: RetryPolicy,
}

impl SourceGate {
    pub fn new(
        source: &'static str,
        limiter: Arc<RateLimiter>,
        budget: BudgetSpec,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            limiter,
            budget,
            policy,
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Every attempt spends one token; token waits count against the retry budget.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let started = Instant::now();
        let budget = self.policy.budget;
        self.policy
            .run(self.source, || {
                let max_wait = budget.saturating_sub(started.elapsed());
                let fut = op();
                async move {
                    self.limiter
                        .acquire(self.source, self.budget, max_wait)
                        .await?;
                    fut.await
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, budget_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            budget: Duration::from_secs(budget_secs),
            jitter: false,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5, 60);
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_base() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(3, 60)
        };
        for _ in 0..50 {
            let d = p.backoff(2);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_surfaces_after_three_retries() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = policy(3, 60)
            .run("steam", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::RateLimited { retry_after: None })
            })
            .await;
        assert_eq!(res, Err(SourceError::RateLimited { retry_after: None }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_beyond_budget_stops_early() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let res: Result<(), _> = policy(3, 60)
            .run("steam", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::RateLimited {
                    retry_after: Some(Duration::from_secs(45)),
                })
            })
            .await;
        assert!(matches!(res, Err(SourceError::RateLimited { .. })));
        // 45s fits the 60s budget once; the second 45s wait would not.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = policy(3, 60)
            .run("riot", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::unavailable("401 unauthorized"))
            })
            .await;
        assert!(matches!(res, Err(SourceError::Unavailable { transient: false, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers() {
        let calls = AtomicU32::new(0);
        let res = policy(3, 60)
            .run("opendota", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::transient("503"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(res, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_waits_for_refill_then_gives_up() {
        let limiter = RateLimiter::new();
        let budget = BudgetSpec::per_minute(2);
        limiter.acquire("opendota", budget, Duration::ZERO).await.unwrap();
        limiter.acquire("opendota", budget, Duration::ZERO).await.unwrap();
        assert_eq!(limiter.remaining("opendota").await, Some(0));

        let err = limiter
            .acquire("opendota", budget, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::RateLimited { retry_after: Some(_) }));

        let started = Instant::now();
        limiter
            .acquire("opendota", budget, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_are_independent_per_source() {
        let limiter = RateLimiter::new();
        let tight = BudgetSpec::per_minute(1);
        limiter.acquire("riot", tight, Duration::ZERO).await.unwrap();
        assert!(limiter.acquire("riot", tight, Duration::ZERO).await.is_err());
        assert!(limiter.acquire("steam", tight, Duration::ZERO).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn gate_spends_one_token_per_attempt() {
        let limiter = RateLimiter::shared();
        let gate = SourceGate::new(
            "opendota",
            limiter.clone(),
            BudgetSpec::per_minute(10),
            policy(2, 60),
        );
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = gate
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::transient("502"))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.remaining("opendota").await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn token_waits_draw_down_the_retry_budget() {
        let limiter = RateLimiter::shared();
        let gate = SourceGate::new(
            "riot",
            limiter,
            BudgetSpec::per_minute(1),
            policy(3, 90),
        );
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let res: Result<(), _> = gate
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::transient("503"))
            })
            .await;
        // t=0 and t=60 reach upstream; at t=62 the next token is 58s away
        // with only 28s of budget left.
        assert!(matches!(res, Err(SourceError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() <= Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_budget_is_clamped_to_one_request() {
        let budget = BudgetSpec::new(0, Duration::ZERO);
        assert_eq!(budget.capacity(), 1);
        assert_eq!(budget.period(), Duration::from_millis(1));

        let limiter = RateLimiter::new();
        limiter.acquire("steam", budget, Duration::ZERO).await.unwrap();
        let err = limiter
            .acquire("steam", budget, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::RateLimited { retry_after: Some(_) }));
        limiter
            .acquire("steam", budget, Duration::from_millis(5))
            .await
            .unwrap();
    }
}
