//! Error types shared by every resilience primitive
//!
//! Rejections raised by the primitives themselves are distinct variants of
//! [`ResilienceError`], so callers can route on them with `matches!` without
//! string comparison. The error produced by the protected operation travels
//! unchanged inside [`ResilienceError::Inner`].

use std::convert::Infallible;
use std::error::Error;
use std::fmt;

/// Errors returned by the circuit breaker, rate limiters and retry executor.
///
/// `E` is the error type of the wrapped operation. Primitives that never run a
/// caller operation (for example [`crate::RateLimiter::wait`]) use the default
/// `Infallible`.
///
/// `Timeout` and `Cancelled` report the matching [`Interrupted`] as their
/// source and `Inner` reports the operation error, so a walk over
/// [`Error::source`] sees through any depth of nesting without knowing `E`.
#[derive(Debug)]
pub enum ResilienceError<E = Infallible> {
    /// Breaker is open and the cooldown has not elapsed yet
    CircuitOpen,

    /// Breaker is half-open and every probe slot is taken
    TooManyRequests,

    /// Admission denied by a rate limiter
    RateLimited,

    /// The caller's deadline passed
    Timeout,

    /// The caller cancelled the operation
    Cancelled,

    /// The protected operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::CircuitOpen => f.write_str("circuit breaker is open"),
            ResilienceError::TooManyRequests => f.write_str("too many requests in half-open state"),
            ResilienceError::RateLimited => f.write_str("request rejected by rate limiter"),
            ResilienceError::Timeout => f.write_str("operation timed out"),
            ResilienceError::Cancelled => f.write_str("operation cancelled"),
            ResilienceError::Inner(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl<E: Error + 'static> Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ResilienceError::Timeout => Some(&Interrupted::DeadlineExceeded),
            ResilienceError::Cancelled => Some(&Interrupted::Cancelled),
            ResilienceError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// True for errors raised by an admission check (breaker or limiter)
    /// before the operation ran.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen
                | ResilienceError::TooManyRequests
                | ResilienceError::RateLimited
        )
    }

    /// True when the caller's context fired.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ResilienceError::Timeout | ResilienceError::Cancelled)
    }

    /// Borrow the operation error, if this is one.
    pub fn inner(&self) -> Option<&E> {
        match self {
            ResilienceError::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Take the operation error, if this is one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Transform the operation error, keeping every other variant.
    pub fn map_inner<F, U>(self, f: F) -> ResilienceError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            ResilienceError::CircuitOpen => ResilienceError::CircuitOpen,
            ResilienceError::TooManyRequests => ResilienceError::TooManyRequests,
            ResilienceError::RateLimited => ResilienceError::RateLimited,
            ResilienceError::Timeout => ResilienceError::Timeout,
            ResilienceError::Cancelled => ResilienceError::Cancelled,
            ResilienceError::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }
}

impl<E> ResilienceError<ResilienceError<E>> {
    /// Collapse the result of nesting one primitive inside another, e.g. a
    /// retry executor driving calls through a circuit breaker.
    pub fn flatten(self) -> ResilienceError<E> {
        match self {
            ResilienceError::Inner(inner) => inner,
            ResilienceError::CircuitOpen => ResilienceError::CircuitOpen,
            ResilienceError::TooManyRequests => ResilienceError::TooManyRequests,
            ResilienceError::RateLimited => ResilienceError::RateLimited,
            ResilienceError::Timeout => ResilienceError::Timeout,
            ResilienceError::Cancelled => ResilienceError::Cancelled,
        }
    }
}

impl ResilienceError<Infallible> {
    /// Re-type an error that carries no operation error.
    pub fn widen<E>(self) -> ResilienceError<E> {
        self.map_inner(|never| match never {})
    }
}

/// Why a [`crate::Context`] stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl<E> From<Interrupted> for ResilienceError<E> {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::Cancelled => ResilienceError::Cancelled,
            Interrupted::DeadlineExceeded => ResilienceError::Timeout,
        }
    }
}

/// Invalid construction parameters for a primitive.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_rejection_classification() {
        assert!(ResilienceError::<Boom>::CircuitOpen.is_rejection());
        assert!(ResilienceError::<Boom>::TooManyRequests.is_rejection());
        assert!(ResilienceError::<Boom>::RateLimited.is_rejection());
        assert!(!ResilienceError::<Boom>::Timeout.is_rejection());
        assert!(!ResilienceError::Inner(Boom).is_rejection());

        assert!(ResilienceError::<Boom>::Cancelled.is_interrupted());
        assert!(ResilienceError::<Boom>::Timeout.is_interrupted());
    }

    #[test]
    fn test_flatten_nested() {
        let nested: ResilienceError<ResilienceError<Boom>> =
            ResilienceError::Inner(ResilienceError::CircuitOpen);
        assert!(matches!(nested.flatten(), ResilienceError::CircuitOpen));

        let outer: ResilienceError<ResilienceError<Boom>> = ResilienceError::Cancelled;
        assert!(matches!(outer.flatten(), ResilienceError::Cancelled));

        let op: ResilienceError<ResilienceError<Boom>> =
            ResilienceError::Inner(ResilienceError::Inner(Boom));
        assert_eq!(op.flatten().into_inner(), Some(Boom));
    }

    #[test]
    fn test_display_passes_through_inner() {
        let err = ResilienceError::Inner(Boom);
        assert_eq!(err.to_string(), "boom");
        assert_eq!(
            ResilienceError::<Boom>::CircuitOpen.to_string(),
            "circuit breaker is open"
        );
    }

    #[test]
    fn test_source_chain_reaches_interruption() {
        let err = ResilienceError::<Boom>::Timeout;
        let source = err.source().and_then(|s| s.downcast_ref::<Interrupted>());
        assert_eq!(source, Some(&Interrupted::DeadlineExceeded));

        let nested: ResilienceError<ResilienceError<std::io::Error>> =
            ResilienceError::Inner(ResilienceError::Cancelled);
        let reason = nested
            .source()
            .and_then(|s| s.source())
            .and_then(|s| s.downcast_ref::<Interrupted>());
        assert_eq!(reason, Some(&Interrupted::Cancelled));

        assert!(ResilienceError::<Boom>::CircuitOpen.source().is_none());
        let inner = ResilienceError::Inner(Boom);
        assert!(inner.source().is_some_and(|s| s.is::<Boom>()));
    }

    #[test]
    fn test_interrupted_conversion() {
        let err: ResilienceError<Boom> = Interrupted::DeadlineExceeded.into();
        assert!(matches!(err, ResilienceError::Timeout));
        let err: ResilienceError<Boom> = Interrupted::Cancelled.into();
        assert!(matches!(err, ResilienceError::Cancelled));
    }
}
