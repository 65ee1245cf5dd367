//! State-change notifications for circuit breakers
//!
//! Transitions are published after the breaker's lock is released. Every
//! transition goes to a broadcast channel (see [`crate::CircuitBreaker::subscribe`]),
//! and to the optional configured callback, which runs on a spawned task when a
//! Tokio runtime is available. Neither path is ordered with respect to the next
//! state read: a subscriber may observe `Closed -> Open` after the breaker has
//! already moved on to `HalfOpen`.

use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Buffered transitions per subscriber before the slowest one starts lagging
pub const EVENT_CAPACITY: usize = 64;

/// Callback invoked for every transition, off the breaker's lock
pub type StateChangeCallback = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// One state change of a named breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub name: Arc<str>,
    pub from: CircuitState,
    pub to: CircuitState,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.name, self.from, self.to)
    }
}

#[derive(Clone)]
pub(crate) struct Notifier {
    events: broadcast::Sender<StateTransition>,
    callback: Option<StateChangeCallback>,
}

impl Notifier {
    pub(crate) fn new(
        events: broadcast::Sender<StateTransition>,
        callback: Option<StateChangeCallback>,
    ) -> Self {
        Self { events, callback }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, transition: StateTransition) {
        match transition.to {
            CircuitState::Open => warn!(
                breaker = %transition.name,
                from = %transition.from,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(
                breaker = %transition.name,
                "Circuit breaker half-open, probing dependency"
            ),
            CircuitState::Closed => info!(
                breaker = %transition.name,
                from = %transition.from,
                "Circuit breaker closed"
            ),
        }

        // No subscribers is not an error
        let _ = self.events.send(transition.clone());

        if let Some(callback) = &self.callback {
            let callback = callback.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { callback(&transition) });
                }
                Err(_) => callback(&transition),
            }
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.events.receiver_count())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
