//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Testing if service has recovered
//!
//! ```text
//! Closed ──(max_failures consecutive failures)──> Open
//! Open ──(open_timeout elapsed, next call)──> HalfOpen
//! HalfOpen ──(success_threshold successes)──> Closed
//! HalfOpen ──(any failure)──> Open
//! ```
//!
//! The lock is held only to admit a call and to record its result, never while
//! the protected operation runs.

use crate::context::Context;
use crate::error::{ConfigError, ResilienceError};
use crate::events::{Notifier, StateChangeCallback, StateTransition, EVENT_CAPACITY};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing service recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a failed call should still count as a success, e.g. a
/// "not found" answer that proves the dependency is healthy.
pub type SuccessClassifier = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// Configuration for circuit breaker behavior
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening the circuit
    pub max_failures: u32,
    /// Time since the last failure before an open circuit admits a probe
    pub open_timeout: Duration,
    /// Probes admitted per half-open episode
    pub max_half_open_requests: u32,
    /// Successful probes needed to close the circuit. `None` uses
    /// `max_half_open_requests`.
    pub success_threshold: Option<u32>,
    /// Failure classification override; by default every error is a failure
    pub is_successful: Option<SuccessClassifier>,
    pub on_state_change: Option<StateChangeCallback>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(30),
            max_half_open_requests: 3,
            success_threshold: None,
            is_successful: None,
            on_state_change: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("max_failures", &self.max_failures)
            .field("open_timeout", &self.open_timeout)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("success_threshold", &self.success_threshold)
            .field("is_successful", &self.is_successful.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    /// Successful probes needed to close the circuit
    pub fn effective_success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(self.max_half_open_requests)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failures == 0 {
            return Err(ConfigError::invalid("max_failures", "must be at least 1"));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::invalid("open_timeout", "must be greater than zero"));
        }
        if self.max_half_open_requests == 0 {
            return Err(ConfigError::invalid(
                "max_half_open_requests",
                "must be at least 1",
            ));
        }
        let threshold = self.effective_success_threshold();
        if threshold == 0 || threshold > self.max_half_open_requests {
            return Err(ConfigError::invalid(
                "success_threshold",
                format!(
                    "{threshold} must be between 1 and max_half_open_requests ({})",
                    self.max_half_open_requests
                ),
            ));
        }
        Ok(())
    }

    /// Replace zero values with defaults and clamp the success threshold into
    /// the probe budget, so the circuit can always close again.
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_failures == 0 {
            self.max_failures = defaults.max_failures;
        }
        if self.open_timeout.is_zero() {
            self.open_timeout = defaults.open_timeout;
        }
        if self.max_half_open_requests == 0 {
            self.max_half_open_requests = defaults.max_half_open_requests;
        }
        self.success_threshold = Some(
            self.effective_success_threshold()
                .clamp(1, self.max_half_open_requests),
        );
        self
    }
}

/// Point-in-time view of a breaker for monitoring
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub half_open_probes: u32,
    /// Whether the next call would be admitted
    pub is_allowing: bool,
    pub last_failure_age: Option<Duration>,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Consecutive failures while Closed
    failures: u32,
    /// Successful probes while HalfOpen
    successes: u32,
    /// Probes admitted in the current half-open episode
    half_open_probes: u32,
    last_failure_at: Option<Instant>,
    /// Bumped on every transition; results from an earlier episode are ignored
    episode: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            half_open_probes: 0,
            last_failure_at: None,
            episode: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.failures = 0;
        self.successes = 0;
        self.half_open_probes = 0;
        self.episode += 1;
        Some((from, to))
    }
}

#[derive(Debug)]
struct Shared {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    notifier: Notifier,
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning is cheap; clones share state.
///
/// # Example
/// ```no_run
/// use ward_core_resilience::{CircuitBreaker, CircuitBreakerConfig, Context, ResilienceError};
/// use std::time::Duration;
///
/// # async fn query() -> Result<u32, std::io::Error> { Ok(42) }
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError<std::io::Error>> {
///     let breaker = CircuitBreaker::new("postgres", CircuitBreakerConfig {
///         max_failures: 3,
///         open_timeout: Duration::from_secs(10),
///         ..Default::default()
///     });
///
///     let rows = breaker.execute(&Context::background(), |_ctx| query()).await?;
///     println!("rows: {}", rows);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a breaker with its own notification channel.
    ///
    /// Zero-valued limits are replaced by the defaults; use
    /// [`CircuitBreakerConfig::validate`] to reject them instead.
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(name.into(), config, events)
    }

    /// Create a breaker with the default configuration
    pub fn new_default(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub(crate) fn with_events(
        name: Arc<str>,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<StateTransition>,
    ) -> Self {
        let config = config.normalized();
        let notifier = Notifier::new(events, config.on_state_change.clone());
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                state: Mutex::new(BreakerState::new()),
                notifier,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.shared.state.lock().state
    }

    /// Receive every future state transition of this breaker
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.notifier.subscribe()
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let now = Instant::now();
        let config = &self.shared.config;
        let state = self.shared.state.lock();

        let is_allowing = match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => state
                .last_failure_at
                .map_or(true, |at| now.saturating_duration_since(at) >= config.open_timeout),
            CircuitState::HalfOpen => state.half_open_probes < config.max_half_open_requests,
        };

        BreakerMetrics {
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            half_open_probes: state.half_open_probes,
            is_allowing,
            last_failure_age: state
                .last_failure_at
                .map(|at| now.saturating_duration_since(at)),
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let transition = {
            let mut state = self.shared.state.lock();
            let transition = state.transition(CircuitState::Closed);
            state.failures = 0;
            state.successes = 0;
            state.half_open_probes = 0;
            state.last_failure_at = None;
            transition
        };
        self.publish(transition);
    }

    /// Run `op` if the breaker admits it.
    ///
    /// Rejected calls return `CircuitOpen` or `TooManyRequests` without running
    /// `op`. A context that has already fired returns `Cancelled`/`Timeout`
    /// without consuming an admission.
    pub async fn execute<F, Fut, T, E>(&self, ctx: &Context, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let permit = self.acquire().map_err(|rejection| {
            debug!(breaker = %self.shared.name, %rejection, "Call rejected");
            rejection.widen()
        })?;

        let result = op(ctx.clone()).await;
        let success = match &result {
            Ok(_) => true,
            Err(err) => self.classify(err),
        };
        permit.settle(success);

        result.map_err(ResilienceError::Inner)
    }

    /// Like [`CircuitBreaker::execute`], but a rejection is handed to
    /// `fallback` instead of being returned. Errors from `op` itself are never
    /// passed to the fallback.
    pub async fn execute_with_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        ctx: &Context,
        op: F,
        fallback: FB,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(Context, ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Error + 'static,
    {
        match self.execute(ctx, op).await {
            Err(rejection @ (ResilienceError::CircuitOpen | ResilienceError::TooManyRequests)) => {
                fallback(ctx.clone(), rejection).await
            }
            other => other,
        }
    }

    fn classify<E: Error + 'static>(&self, err: &E) -> bool {
        match &self.shared.config.is_successful {
            Some(is_successful) => is_successful(err),
            None => false,
        }
    }

    fn acquire(&self) -> Result<Permit<'_>, ResilienceError> {
        let config = &self.shared.config;
        let now = Instant::now();

        let (outcome, transition) = {
            let mut state = self.shared.state.lock();
            match state.state {
                CircuitState::Closed => (Ok((state.episode, false)), None),
                CircuitState::Open => {
                    let cooled_down = state
                        .last_failure_at
                        .map_or(true, |at| now.saturating_duration_since(at) >= config.open_timeout);
                    if cooled_down {
                        let transition = state.transition(CircuitState::HalfOpen);
                        state.half_open_probes = 1;
                        (Ok((state.episode, true)), transition)
                    } else {
                        (Err(ResilienceError::CircuitOpen), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if state.half_open_probes < config.max_half_open_requests {
                        state.half_open_probes += 1;
                        (Ok((state.episode, true)), None)
                    } else {
                        (Err(ResilienceError::TooManyRequests), None)
                    }
                }
            }
        };

        self.publish(transition);
        outcome.map(|(episode, probe)| Permit {
            breaker: self,
            episode,
            probe,
            settled: false,
        })
    }

    fn record(&self, episode: u64, success: bool) {
        let config = &self.shared.config;
        let now = Instant::now();

        let transition = {
            let mut state = self.shared.state.lock();
            if state.episode != episode {
                return;
            }
            match state.state {
                CircuitState::Closed if success => {
                    state.failures = 0;
                    None
                }
                CircuitState::Closed => {
                    state.failures += 1;
                    state.last_failure_at = Some(now);
                    if state.failures >= config.max_failures {
                        state.transition(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if success => {
                    state.successes += 1;
                    if state.successes >= config.effective_success_threshold() {
                        state.transition(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    state.last_failure_at = Some(now);
                    state.transition(CircuitState::Open)
                }
                CircuitState::Open => None,
            }
        };

        self.publish(transition);
    }

    /// Give back the probe slot of a call that never reported a result
    fn release_probe(&self, episode: u64) {
        let mut state = self.shared.state.lock();
        if state.episode == episode && state.state == CircuitState::HalfOpen {
            state.half_open_probes = state.half_open_probes.saturating_sub(1);
        }
    }

    fn publish(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            self.shared.notifier.publish(StateTransition {
                name: self.shared.name.clone(),
                from,
                to,
            });
        }
    }
}

/// Admission ticket for one call. Dropping it unsettled (the caller's future
/// was cancelled mid-call) frees the half-open probe slot it occupied.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    episode: u64,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(self.episode, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(self.episode);
        }
    }
}
