//! Named circuit breakers, one per downstream dependency
//!
//! Breakers are created lazily from the registry defaults or from a per-name
//! override supplied when the registry is built. All breakers publish their
//! transitions on the registry's shared channel.

use crate::circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig};
use crate::context::Context;
use crate::error::ResilienceError;
use crate::events::{StateTransition, EVENT_CAPACITY};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, CircuitBreaker>,
    events: broadcast::Sender<StateTransition>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
            events,
        }
    }

    /// Use `config` instead of the defaults for the breaker called `name`
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        self.breakers.remove(&name);
        self.overrides.insert(name, config);
        self
    }

    /// Configuration a breaker called `name` gets on creation
    pub fn config_for(&self, name: &str) -> &CircuitBreakerConfig {
        self.overrides.get(name).unwrap_or(&self.defaults)
    }

    /// Fetch the breaker called `name`, creating it exactly once
    pub fn get(&self, name: &str) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.get(name) {
            return breaker.value().clone();
        }

        self.breakers
            .entry(name.to_owned())
            .or_insert_with(|| {
                debug!(breaker = name, "Creating circuit breaker");
                CircuitBreaker::with_events(
                    Arc::from(name),
                    self.config_for(name).clone(),
                    self.events.clone(),
                )
            })
            .value()
            .clone()
    }

    /// Run `op` through the breaker called `name`
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: &Context,
        name: &str,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        self.get(name).execute(ctx, op).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.breakers.contains_key(name)
    }

    /// Names of the breakers created so far, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Metrics of every breaker, keyed by name
    pub fn all_metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    /// Force every breaker back to Closed
    pub fn reset_all(&self) {
        // Collect first so no shard lock is held while transitions publish
        let breakers: Vec<CircuitBreaker> = self.breakers.iter().map(|e| e.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Transitions of every breaker in this registry
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }
}
