//! Retry executor with pluggable backoff and uniform jitter
//!
//! The executor is a bounded loop, not a persistent automaton: every call to
//! [`RetryExecutor::run`] starts from attempt one, and the executor itself
//! holds nothing but immutable configuration.
//!
//! # Example
//!
//! ```no_run
//! use ward_core_resilience::{Context, RetryConfig, RetryExecutor, ResilienceError};
//! use ward_core_resilience::backoff::ConstantBackoff;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn fetch() -> Result<u32, std::io::Error> { Ok(7) }
//! # async fn example() -> Result<(), ResilienceError<std::io::Error>> {
//! let retry = RetryExecutor::new(RetryConfig {
//!     max_attempts: 5,
//!     backoff: Arc::new(ConstantBackoff::new(Duration::from_millis(50))),
//!     ..Default::default()
//! });
//!
//! let value = retry.run(&Context::background(), |_ctx| fetch()).await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

use crate::backoff::{BackoffStrategy, ExponentialBackoff};
use crate::context::Context;
use crate::error::{ConfigError, Interrupted, ResilienceError};
use rand::Rng;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides whether a failed attempt should be retried
pub type RetryPredicate = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// Observes a retry before its backoff sleep: `(attempt, error, delay)`.
/// `attempt` is the one-based number of the attempt that just failed.
pub type RetryHook = Arc<dyn Fn(u32, &(dyn Error + 'static), Duration) + Send + Sync>;

/// Uniform random perturbation of a backoff delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    pub enabled: bool,
    /// Fraction of the delay, in `0.0..=1.0`
    pub factor: f64,
}

impl Default for Jitter {
    fn default() -> Self {
        Self {
            enabled: true,
            factor: 0.2,
        }
    }
}

impl Jitter {
    pub fn none() -> Self {
        Self {
            enabled: false,
            factor: 0.0,
        }
    }

    /// Perturb `delay` uniformly within `[-delay*factor, +delay*factor]`,
    /// clamped at zero
    pub fn apply(&self, delay: Duration) -> Duration {
        if !self.enabled || self.factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread: f64 = rand::rng().random_range(-1.0..=1.0);
        let secs = delay.as_secs_f64() * (1.0 + self.factor * spread);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(delay)
    }
}

/// Operation error carrying an explicit retry decision.
///
/// The default predicate honours the decision wherever the wrapper sits in
/// the source chain, ahead of every other rule.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Retryable {
    #[source]
    error: Box<dyn Error + Send + Sync + 'static>,
    retryable: bool,
}

impl Retryable {
    /// Mark `error` as worth another attempt
    pub fn transient(error: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self {
            error: error.into(),
            retryable: true,
        }
    }

    /// Mark `error` as final; retrying cannot help
    pub fn permanent(error: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn get_ref(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.error.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn Error + Send + Sync + 'static> {
        self.error
    }
}

/// Default predicate: an explicit [`Retryable`] decision anywhere in the
/// source chain wins; otherwise retry everything except interruptions.
///
/// Interruptions are found at any depth, including `Timeout`/`Cancelled`
/// from a primitive nested inside the retried operation.
pub fn retry_unless_interrupted(err: &(dyn Error + 'static)) -> bool {
    let mut interrupted = false;
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(decision) = e.downcast_ref::<Retryable>() {
            return decision.is_retryable();
        }
        interrupted |= e.is::<Interrupted>();
        current = e.source();
    }
    !interrupted
}

/// Immutable retry policy
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one (>= 1)
    pub max_attempts: u32,
    pub backoff: Arc<dyn BackoffStrategy>,
    /// Upper bound applied to every strategy's delay before jitter
    pub max_delay: Duration,
    pub jitter: Jitter,
    pub retry_if: RetryPredicate,
    pub on_retry: Option<RetryHook>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Arc::new(ExponentialBackoff::default()),
            max_delay: Duration::from_secs(30),
            jitter: Jitter::default(),
            retry_if: Arc::new(retry_unless_interrupted),
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<hook>"))
            .finish_non_exhaustive()
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter.factor) {
            return Err(ConfigError::invalid(
                "jitter_factor",
                format!("{} is outside 0.0..=1.0", self.jitter.factor),
            ));
        }
        Ok(())
    }

    /// Replace out-of-range values with the nearest usable ones
    fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.jitter.factor = if self.jitter.factor.is_nan() {
            0.0
        } else {
            self.jitter.factor.clamp(0.0, 1.0)
        };
        self
    }
}

/// Drives a fallible operation until it succeeds, fails permanently, runs out
/// of attempts, or the caller's context fires.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry with zero-based index `attempt`, capped and jittered
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.backoff.delay(attempt).min(self.config.max_delay);
        self.config.jitter.apply(base)
    }

    /// Run `op` with retries.
    ///
    /// Returns the first success, the first non-retryable error, or the last
    /// error once attempts are exhausted. A fired context returns
    /// `Cancelled`/`Timeout` in preference to the operation's error.
    pub async fn run<T, E, F, Fut>(&self, ctx: &Context, mut op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let max_attempts = self.config.max_attempts;
        let mut attempt = 0;

        loop {
            if let Some(reason) = ctx.err() {
                return Err(reason.into());
            }

            attempt += 1;
            let err = match op(ctx.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let source: &(dyn Error + 'static) = &err;
            if !(self.config.retry_if)(source) {
                debug!(attempt, error = %err, "Error is not retryable");
                return Err(ResilienceError::Inner(err));
            }

            if attempt >= max_attempts {
                debug!(attempts = attempt, error = %err, "Retry attempts exhausted");
                return Err(ResilienceError::Inner(err));
            }

            let delay = self.delay_for(attempt - 1);
            if let Some(hook) = &self.config.on_retry {
                hook(attempt, source, delay);
            }
            debug!(attempt, max_attempts, ?delay, error = %err, "Retrying after failure");

            if let Err(reason) = ctx.sleep(delay).await {
                return Err(reason.into());
            }
        }
    }

    /// Error-only convenience form of [`RetryExecutor::run`] without a caller context
    pub async fn retry<E, F, Fut>(&self, mut op: F) -> Result<(), ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Error + 'static,
    {
        self.run(&Context::background(), move |_| op()).await
    }
}
