//! Ward Core Resilience: fault tolerance primitives for calls to dependencies
//!
//! # Overview
//!
//! This crate provides building blocks for services that call flaky downstream
//! dependencies. It includes:
//!
//! - **Circuit Breaker**: Fails fast while a dependency is unhealthy, probes it after a cooldown
//! - **Breaker Registry**: One lazily created breaker per named dependency
//! - **Rate Limiter**: Token bucket with non-blocking and waiting admission
//! - **Keyed Rate Limiter**: A token bucket per client key with idle eviction
//! - **Retry**: Bounded attempts with pluggable backoff and jitter
//! - **Context**: Cancellation and deadlines that every waiting operation honors
//!
//! # Key Principles
//!
//! The primitives know nothing about the operations they protect. An operation
//! is any closure returning a future of `Result<T, E>`; the primitives add
//! their own rejections around `E` through [`ResilienceError`]. Locks are held
//! only for bookkeeping, never across a protected call or a sleep.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter / Keyed Limiter      │  ← Prevent overload
//! │  (Token bucket, per process or client)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Executor                    │  ← Ride out transient faults
//! │  (Backoff + jitter, context-aware)      │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker (per dependency)  │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Service
//!     (Database, HTTP API, Queue)
//! ```
//!
//! # Usage Example
//!
//! ## Retry around a Circuit Breaker
//!
//! ```no_run
//! use ward_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! # async fn fetch() -> Result<u32, std::io::Error> { Ok(42) }
//! # async fn example() -> Result<(), ResilienceError<std::io::Error>> {
//! let breaker = CircuitBreaker::new("inventory", CircuitBreakerConfig {
//!     max_failures: 5,
//!     open_timeout: Duration::from_secs(60),
//!     ..Default::default()
//! });
//! let retry = RetryExecutor::new(RetryConfig {
//!     max_attempts: 3,
//!     ..Default::default()
//! });
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(5));
//! let value = retry
//!     .run(&ctx, |ctx| {
//!         let breaker = breaker.clone();
//!         async move { breaker.execute(&ctx, |_| fetch()).await }
//!     })
//!     .await
//!     .map_err(|e| e.flatten())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Per-client Rate Limiting
//!
//! ```no_run
//! use ward_core_resilience::{KeyedRateLimiter, KeyedRateLimiterConfig};
//!
//! # async fn example() {
//! let limiter = KeyedRateLimiter::start(KeyedRateLimiterConfig {
//!     rate: 10.0,
//!     burst: 20,
//!     ..Default::default()
//! });
//!
//! if limiter.allow("tenant-a") {
//!     // serve the request
//! }
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod events;
pub mod keyed;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

// Re-export main types for convenience
pub use backoff::{BackoffStrategy, ConstantBackoff, ExponentialBackoff, LinearBackoff};
pub use circuit_breaker::{
    BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState, SuccessClassifier,
};
pub use context::Context;
pub use error::{ConfigError, Interrupted, ResilienceError};
pub use events::{StateChangeCallback, StateTransition};
pub use keyed::{KeyedRateLimiter, KeyedRateLimiterConfig};
pub use rate_limiter::RateLimiter;
pub use registry::CircuitBreakerRegistry;
pub use retry::{
    retry_unless_interrupted, Jitter, RetryConfig, RetryExecutor, RetryHook, RetryPredicate,
    Retryable,
};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use ward_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{BackoffStrategy, ConstantBackoff, ExponentialBackoff, LinearBackoff};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::context::Context;
    pub use super::error::ResilienceError;
    pub use super::keyed::{KeyedRateLimiter, KeyedRateLimiterConfig};
    pub use super::rate_limiter::RateLimiter;
    pub use super::registry::CircuitBreakerRegistry;
    pub use super::retry::{Jitter, RetryConfig, RetryExecutor, Retryable};
}
