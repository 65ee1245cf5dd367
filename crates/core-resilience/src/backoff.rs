//! Backoff strategies: attempt index -> delay
//!
//! Strategies are pure functions of the zero-based retry index. Jitter is not
//! part of a strategy; the [`crate::RetryExecutor`] applies it uniformly to
//! whichever strategy it drives.
//!
//! # Example
//!
//! ```
//! use ward_core_resilience::backoff::{BackoffStrategy, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff {
//!     initial: Duration::from_millis(100),
//!     max: Duration::from_secs(1),
//!     multiplier: 2.0,
//! };
//!
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(400));
//! assert_eq!(backoff.delay(4), Duration::from_secs(1));
//! ```

use std::fmt::Debug;
use std::time::Duration;

/// Computes the delay to wait before the retry with the given zero-based index.
pub trait BackoffStrategy: Debug + Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay before every retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBackoff {
    pub delay: Duration,
}

impl ConstantBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `initial + attempt * increment`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub initial: Duration,
    pub increment: Duration,
    pub max: Duration,
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.increment
            .checked_mul(attempt)
            .and_then(|step| self.initial.checked_add(step))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// `initial * multiplier^attempt`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial.min(self.max);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);

        // Overflow, NaN and negative products all land on the cap
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max),
            Err(_) => self.max,
        }
    }
}
