//! Rate limiting for preventing service overload
//!
//! Token bucket: the balance refills continuously at `rate` tokens per second
//! up to `burst`, and every admitted request consumes tokens. The refill is
//! computed lazily on each access, so an idle limiter costs nothing.

use crate::context::Context;
use crate::error::{ConfigError, ResilienceError};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, burst: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }
}

/// Token bucket rate limiter
///
/// # Example
/// ```
/// use ward_core_resilience::RateLimiter;
///
/// // 10 requests per second, bursts of up to 5
/// let limiter = RateLimiter::new(10.0, 5);
///
/// for _ in 0..5 {
///     assert!(limiter.allow());
/// }
/// assert!(!limiter.allow());
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens added per second
    rate: f64,
    /// Maximum accumulated tokens
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter that starts with a full bucket.
    ///
    /// A negative or NaN `rate` is treated as zero, which leaves only the
    /// initial burst; a zero `burst` is raised to one. Use
    /// [`RateLimiter::try_new`] to reject such values instead.
    pub fn new(rate: f64, burst: u32) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 {
            rate
        } else {
            0.0
        };
        let burst = burst.max(1);
        let now = Instant::now();

        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: now,
                last_used: now,
            }),
        }
    }

    /// Create a limiter, rejecting parameters [`RateLimiter::new`] would adjust
    pub fn try_new(rate: f64, burst: u32) -> Result<Self, ConfigError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(ConfigError::invalid(
                "rate",
                format!("{rate} is not a finite, non-negative number"),
            ));
        }
        if burst == 0 {
            return Err(ConfigError::invalid("burst", "must be at least 1"));
        }
        Ok(Self::new(rate, burst))
    }

    /// `requests_per_second` sustained, with an equal burst
    pub fn per_second(requests_per_second: u32) -> Self {
        Self::new(f64::from(requests_per_second), requests_per_second)
    }

    /// `requests_per_minute` sustained, with an equal burst
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(f64::from(requests_per_minute) / 60.0, requests_per_minute)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Take one token if available
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Take `n` tokens if all of them are available; never consumes partially
    pub fn allow_n(&self, n: u32) -> bool {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        bucket.refill(now, self.rate, f64::from(self.burst));
        bucket.last_used = now;

        let needed = f64::from(n);
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Current balance after refill, without consuming
    pub fn tokens(&self) -> f64 {
        let bucket = self.bucket.lock();
        let elapsed = Instant::now()
            .saturating_duration_since(bucket.last_refill)
            .as_secs_f64();
        (bucket.tokens + elapsed * self.rate).min(f64::from(self.burst))
    }

    /// When a caller last asked this limiter for tokens
    pub fn last_used(&self) -> Instant {
        self.bucket.lock().last_used
    }

    /// Wait until one token is available
    pub async fn wait(&self, ctx: &Context) -> Result<(), ResilienceError> {
        self.wait_n(ctx, 1).await
    }

    /// Wait until `n` tokens are available and take them.
    ///
    /// Returns `RateLimited` without waiting when the request can never be
    /// satisfied: `n` above the burst, or a zero rate with too few tokens left.
    pub async fn wait_n(&self, ctx: &Context, n: u32) -> Result<(), ResilienceError> {
        if n > self.burst {
            return Err(ResilienceError::RateLimited);
        }

        loop {
            let shortfall = {
                let now = Instant::now();
                let mut bucket = self.bucket.lock();
                bucket.refill(now, self.rate, f64::from(self.burst));
                bucket.last_used = now;

                let needed = f64::from(n);
                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    return Ok(());
                }
                needed - bucket.tokens
            };

            if self.rate <= 0.0 {
                return Err(ResilienceError::RateLimited);
            }

            let wait = Duration::try_from_secs_f64(shortfall / self.rate)
                .unwrap_or(Duration::MAX)
                .max(Duration::from_millis(1));
            ctx.sleep(wait).await?;
        }
    }

    /// Wait for a token, then run the operation
    pub async fn execute<F, Fut, T, E>(&self, ctx: &Context, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.wait(ctx).await.map_err(|e| e.widen())?;
        op(ctx.clone()).await.map_err(ResilienceError::Inner)
    }

    /// Run the operation only if a token is available right now
    pub async fn try_execute<F, Fut, T, E>(&self, ctx: &Context, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(ResilienceError::RateLimited);
        }
        op(ctx.clone()).await.map_err(ResilienceError::Inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_denied() {
        let limiter = RateLimiter::new(10.0, 5);

        for i in 0..5 {
            assert!(limiter.allow(), "call {} should be allowed", i + 1);
        }
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_wait() {
        let limiter = RateLimiter::new(100.0, 5);
        for _ in 0..5 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());

        // 50ms at 100/s is exactly the five spent tokens
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(limiter.tokens() >= 5.0);
        for _ in 0..5 {
            assert!(limiter.allow());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_burst() {
        let limiter = RateLimiter::new(1_000.0, 3);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(limiter.tokens(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_n_no_partial_consumption() {
        let limiter = RateLimiter::new(1.0, 5);
        assert!(limiter.allow_n(3));
        assert!(!limiter.allow_n(3));
        assert!((limiter.tokens() - 2.0).abs() < 1e-9);
        assert!(limiter.allow_n(2));
        assert!(limiter.allow_n(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_only_initial_burst() {
        let limiter = RateLimiter::new(0.0, 2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!limiter.allow());

        let result = limiter.wait(&Context::background()).await;
        assert!(matches!(result, Err(ResilienceError::RateLimited)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_refill() {
        let limiter = RateLimiter::new(10.0, 1);
        assert!(limiter.allow());

        let start = Instant::now();
        limiter.wait(&Context::background()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_pending_while_empty() {
        let limiter = RateLimiter::new(10.0, 1);
        assert!(limiter.allow());

        let ctx = Context::background();
        let mut waiting = tokio_test::task::spawn(limiter.wait(&ctx));
        tokio_test::assert_pending!(waiting.poll());

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio_test::assert_ready_ok!(waiting.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_n_above_burst_rejected() {
        let limiter = RateLimiter::new(10.0, 2);
        let result = limiter.wait_n(&Context::background(), 3).await;
        assert!(matches!(result, Err(ResilienceError::RateLimited)));
        assert_eq!(limiter.tokens(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled_promptly() {
        let limiter = RateLimiter::new(0.001, 1);
        assert!(limiter.allow());

        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = limiter.wait(&ctx).await;
        assert!(matches!(result, Err(ResilienceError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_execute_rejects_without_running() {
        let limiter = RateLimiter::new(0.0, 1);
        let ctx = Context::background();

        let first = limiter
            .try_execute(&ctx, |_| async { Ok::<_, std::io::Error>(1) })
            .await;
        assert_eq!(first.unwrap(), 1);

        let second = limiter
            .try_execute(&ctx, |_| async { Ok::<_, std::io::Error>(2) })
            .await;
        assert!(matches!(second, Err(ResilienceError::RateLimited)));
    }

    #[test]
    fn test_constructors() {
        let limiter = RateLimiter::per_second(100);
        assert_eq!(limiter.rate(), 100.0);
        assert_eq!(limiter.burst(), 100);

        let limiter = RateLimiter::per_minute(60);
        assert_eq!(limiter.rate(), 1.0);
        assert_eq!(limiter.burst(), 60);

        assert!(RateLimiter::try_new(-1.0, 5).is_err());
        assert!(RateLimiter::try_new(f64::NAN, 5).is_err());
        assert!(RateLimiter::try_new(1.0, 0).is_err());
        assert_eq!(RateLimiter::new(-1.0, 0).burst(), 1);
        assert_eq!(RateLimiter::new(-1.0, 0).rate(), 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_overdraw() {
        let limiter = Arc::new(RateLimiter::new(0.0, 100));
        let admitted = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    if limiter.allow() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 100);
        assert!(limiter.tokens() >= 0.0);
    }
}
