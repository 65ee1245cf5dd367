//! Cancellation and deadline propagation
//!
//! A [`Context`] is threaded through every call that may block: the retry
//! executor's backoff sleep, [`crate::RateLimiter::wait`] and the operations
//! themselves. Cloning is cheap and clones observe the same cancellation.

use crate::error::Interrupted;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Wrap an existing cancellation token (e.g. a server shutdown token)
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child that is cancelled with this context and can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is at most `timeout` from now.
    ///
    /// A timeout too large to represent as an instant adds no deadline; the
    /// child keeps this context's deadline, if any.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derive a child with the earlier of `deadline` and this context's deadline
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context has fired, or `None` while it is still live.
    ///
    /// Explicit cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupted::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or its deadline passes
    pub async fn done(&self) -> Interrupted {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => Interrupted::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Interrupted::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Interrupted::Cancelled
            }
        }
    }

    /// Sleep for `duration` unless the context fires first
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
