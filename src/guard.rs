/*!
 * Guard: the resilience primitives composed into one call path
 *
 * ```text
 * call(ctx, dependency, client_key, op)
 *   per-client bucket -> RateLimited
 *   global limiter    -> RateLimited
 *   retry executor
 *     breaker[dependency] -> CircuitOpen / TooManyRequests
 *       op(ctx)
 * ```
 *
 * Every component is built from a `WardConfig` and owned by the guard; there
 * is no process-wide instance.
 */

use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ward_core_resilience::{
    BreakerMetrics, CircuitBreakerRegistry, CircuitState, Context, KeyedRateLimiter, RateLimiter,
    ResilienceError, RetryExecutor,
};

use crate::config::WardConfig;
use crate::error::{Result, WardError};

/// Point-in-time view of a guard, serializable for `ward simulate`
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub breakers: BTreeMap<String, BreakerMetrics>,
    /// Client keys with a live bucket
    pub tracked_clients: usize,
    pub global_tokens: Option<f64>,
    /// Transitions into Open seen by the observer task
    pub trips: u64,
}

pub struct Guard {
    breakers: CircuitBreakerRegistry,
    global: Option<RateLimiter>,
    clients: Arc<KeyedRateLimiter>,
    retry: RetryExecutor,
    trips: Arc<AtomicU64>,
}

impl Guard {
    /// Validate `config` and build every component from it.
    ///
    /// Starts the per-client sweep task, so a Tokio runtime must be running.
    pub fn from_config(config: &WardConfig) -> Result<Self> {
        config.validate()?;

        let global = config
            .rate_limit
            .as_ref()
            .map(|section| section.build())
            .transpose()
            .map_err(|source| WardError::InvalidConfig {
                section: "rate_limit".to_string(),
                source,
            })?;

        Ok(Self::new(
            config.breaker.to_registry(),
            global,
            KeyedRateLimiter::start(config.keyed_rate_limit.to_keyed_config()),
            RetryExecutor::new(config.retry.to_retry_config()),
        ))
    }

    pub fn new(
        breakers: CircuitBreakerRegistry,
        global: Option<RateLimiter>,
        clients: Arc<KeyedRateLimiter>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            breakers,
            global,
            clients,
            retry,
            trips: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn clients(&self) -> &KeyedRateLimiter {
        &self.clients
    }

    /// Run `op` against `dependency` on behalf of `client_key`.
    ///
    /// Admission is checked once per call, retries are not charged again.
    /// The client limit is checked before the global one.
    /// `op` only runs for attempts the breaker admits.
    /// Rejections from any layer and the operation's own error come back
    /// as one flat `ResilienceError<E>`.
    pub async fn call<T, E, F, Fut>(
        &self,
        ctx: &Context,
        dependency: &str,
        client_key: Option<&str>,
        op: F,
    ) -> std::result::Result<T, ResilienceError<E>>
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Error + 'static,
    {
        // Client first, so a client over its own limit cannot drain the
        // shared bucket. A client token is still spent if the global check
        // then rejects.
        if let Some(key) = client_key {
            if !self.clients.allow(key) {
                debug!(dependency, client = key, "Rejected by client rate limit");
                return Err(ResilienceError::RateLimited);
            }
        }

        if let Some(global) = &self.global {
            if !global.allow() {
                debug!(dependency, "Rejected by global rate limit");
                return Err(ResilienceError::RateLimited);
            }
        }

        let breaker = self.breakers.get(dependency);
        let op = &op;
        self.retry
            .run(ctx, move |ctx| {
                let breaker = breaker.clone();
                async move { breaker.execute(&ctx, op).await }
            })
            .await
            .map_err(|e| e.flatten())
    }

    /// Count and log breaker transitions until the guard is dropped
    pub fn spawn_observer(&self) -> JoinHandle<()> {
        let mut events = self.breakers.subscribe();
        let trips = self.trips.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(transition) => {
                        if transition.to == CircuitState::Open {
                            trips.fetch_add(1, Ordering::Relaxed);
                        }
                        debug!(
                            breaker = %transition.name,
                            from = %transition.from,
                            to = %transition.to,
                            "Observed breaker transition"
                        );
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Breaker observer fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            breakers: self.breakers.all_metrics(),
            tracked_clients: self.clients.len(),
            global_tokens: self.global.as_ref().map(|limiter| limiter.tokens()),
            trips: self.trips.load(Ordering::Relaxed),
        }
    }

    /// Stop background work; the guard keeps serving calls
    pub fn shutdown(&self) {
        self.clients.shutdown();
    }
}
