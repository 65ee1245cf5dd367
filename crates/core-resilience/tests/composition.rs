//! Primitives composed the way callers use them: limiter in front, retry
//! around a named breaker, everything bounded by one caller context.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use ward_core_resilience::prelude::*;
use ward_core_resilience::{RetryHook, StateTransition};

fn retry_constant(max_attempts: u32, delay: Duration) -> RetryExecutor {
    RetryExecutor::new(RetryConfig {
        max_attempts,
        backoff: Arc::new(ConstantBackoff::new(delay)),
        jitter: Jitter::none(),
        ..Default::default()
    })
}

fn unavailable() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
}

#[tokio::test(start_paused = true)]
async fn test_retry_stops_once_breaker_opens() {
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        max_failures: 3,
        open_timeout: Duration::from_secs(30),
        ..Default::default()
    });
    let retry = retry_constant(5, Duration::from_millis(10));
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = retry
        .run(&Context::background(), |ctx| {
            let breaker = registry.get("orders");
            let calls = &calls;
            async move {
                breaker
                    .execute(&ctx, |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(unavailable())
                    })
                    .await
            }
        })
        .await
        .map_err(|e| e.flatten());

    assert!(matches!(result, Err(ResilienceError::CircuitOpen)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(registry.get("orders").state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_retry_backoff() {
    let retry = retry_constant(10, Duration::from_secs(1));
    let ctx = Context::background().with_timeout(Duration::from_millis(2_500));
    let start = Instant::now();

    let result: Result<(), _> = retry
        .run(&ctx, |_| async { Err::<(), _>(unavailable()) })
        .await;

    assert!(matches!(result, Err(ResilienceError::Timeout)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(2_500));
    assert!(elapsed < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_after_cooldown() {
    let breaker = CircuitBreaker::new(
        "search",
        CircuitBreakerConfig {
            max_failures: 1,
            open_timeout: Duration::from_secs(5),
            max_half_open_requests: 2,
            ..Default::default()
        },
    );
    let mut events = breaker.subscribe();
    let ctx = Context::background();

    let _ = breaker
        .execute(&ctx, |_| async { Err::<(), _>(unavailable()) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(5)).await;
    for _ in 0..2 {
        breaker
            .execute(&ctx, |_| async { Ok::<_, io::Error>(()) })
            .await
            .unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);

    let mut seen: Vec<StateTransition> = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let path: Vec<_> = seen.iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_paces_work() {
    let limiter = RateLimiter::new(10.0, 1);
    let ctx = Context::background();
    let start = Instant::now();

    for i in 0..5u32 {
        let value = limiter
            .execute(&ctx, |_| async move { Ok::<_, io::Error>(i) })
            .await
            .unwrap();
        assert_eq!(value, i);
    }

    // First call uses the burst, the other four wait ~100ms each
    assert!(start.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn test_retry_hook_sees_every_backoff() {
    let delays = Arc::new(support::Recorder::default());
    let recorder = delays.clone();
    let hook: RetryHook = Arc::new(move |attempt: u32, _err: &(dyn std::error::Error + 'static), delay: Duration| {
        recorder.push(attempt, delay);
    });

    let retry = RetryExecutor::new(RetryConfig {
        max_attempts: 4,
        backoff: Arc::new(ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }),
        jitter: Jitter::none(),
        on_retry: Some(hook),
        ..Default::default()
    });

    let _ = retry
        .run(&Context::background(), |_| async { Err::<(), _>(unavailable()) })
        .await;

    assert_eq!(
        delays.take(),
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
            (3, Duration::from_millis(400)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_keyed_limits_are_per_client() {
    let limiter = KeyedRateLimiter::new(KeyedRateLimiterConfig {
        rate: 1.0,
        burst: 3,
        ..Default::default()
    });

    let admitted_a = (0..5).filter(|_| limiter.allow("a")).count();
    let admitted_b = (0..5).filter(|_| limiter.allow("b")).count();
    assert_eq!((admitted_a, admitted_b), (3, 3));

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(limiter.allow("a"));
    assert!(!limiter.allow("a"));
}

mod support {
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub struct Recorder(Mutex<Vec<(u32, Duration)>>);

    impl Recorder {
        pub fn push(&self, attempt: u32, delay: Duration) {
            self.0.lock().unwrap().push((attempt, delay));
        }

        pub fn take(&self) -> Vec<(u32, Duration)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }
}
