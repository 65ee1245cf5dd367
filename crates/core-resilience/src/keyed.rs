//! Per-key rate limiting
//!
//! One token bucket per key (client id, tenant, remote address), created on
//! first use. A background sweep evicts buckets that are both full and unused
//! for `idle_timeout`; such a bucket is indistinguishable from a fresh one, so
//! eviction never changes what a caller observes.

use crate::error::ConfigError;
use crate::rate_limiter::RateLimiter;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration shared by every per-key bucket
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRateLimiterConfig {
    /// Tokens added per second, per key
    pub rate: f64,
    /// Bucket capacity, per key
    pub burst: u32,
    /// Period of the background sweep
    pub cleanup_interval: Duration,
    /// A full bucket must also be unused this long before eviction.
    /// Zero evicts any full bucket.
    pub idle_timeout: Duration,
}

impl Default for KeyedRateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20,
            cleanup_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl KeyedRateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate.is_finite() || self.rate < 0.0 {
            return Err(ConfigError::invalid(
                "rate",
                format!("{} is not a finite, non-negative number", self.rate),
            ));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid("burst", "must be at least 1"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid(
                "cleanup_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Token buckets keyed by string
///
/// # Example
/// ```no_run
/// use ward_core_resilience::{KeyedRateLimiter, KeyedRateLimiterConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let limiter = KeyedRateLimiter::start(KeyedRateLimiterConfig {
///         rate: 5.0,
///         burst: 10,
///         ..Default::default()
///     });
///
///     if !limiter.allow("203.0.113.7") {
///         println!("slow down");
///     }
/// }
/// ```
#[derive(Debug)]
pub struct KeyedRateLimiter {
    config: KeyedRateLimiterConfig,
    limiters: DashMap<String, RateLimiter>,
    shutdown: CancellationToken,
}

impl KeyedRateLimiter {
    /// Create a limiter without a background sweep; call
    /// [`KeyedRateLimiter::sweep`] yourself or use [`KeyedRateLimiter::start`].
    pub fn new(mut config: KeyedRateLimiterConfig) -> Self {
        if config.cleanup_interval.is_zero() {
            config.cleanup_interval = KeyedRateLimiterConfig::default().cleanup_interval;
        }
        Self {
            config,
            limiters: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a limiter and spawn its sweep task on the current runtime.
    ///
    /// The task exits on [`KeyedRateLimiter::shutdown`] or once the limiter
    /// is dropped.
    pub fn start(config: KeyedRateLimiterConfig) -> Arc<Self> {
        let limiter = Arc::new(Self::new(config));
        limiter.spawn_cleanup();
        limiter
    }

    pub fn config(&self) -> &KeyedRateLimiterConfig {
        &self.config
    }

    /// Take one token from `key`'s bucket
    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1)
    }

    /// Take `n` tokens from `key`'s bucket, creating it on first use.
    ///
    /// Admission runs while the map entry is held, so a concurrent sweep can
    /// never evict a bucket between its lookup and its consumption.
    pub fn allow_n(&self, key: &str, n: u32) -> bool {
        if let Some(limiter) = self.limiters.get(key) {
            return limiter.allow_n(n);
        }

        self.limiters
            .entry(key.to_owned())
            .or_insert_with(|| RateLimiter::new(self.config.rate, self.config.burst))
            .allow_n(n)
    }

    /// Current balance of `key`'s bucket, if it exists
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.limiters.get(key).map(|limiter| limiter.tokens())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.limiters.contains_key(key)
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Evict idle full buckets, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let burst = f64::from(self.config.burst);
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = 0;

        self.limiters.retain(|_, limiter| {
            let idle = now.saturating_duration_since(limiter.last_used()) >= idle_timeout;
            let keep = !(idle && limiter.tokens() >= burst);
            if !keep {
                evicted += 1;
            }
            keep
        });

        evicted
    }

    /// Spawn the periodic sweep. Requires a Tokio runtime.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let evicted = limiter.sweep();
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.len(), "Evicted idle rate limiters");
                }
            }

            debug!("Keyed rate limiter cleanup stopped");
        })
    }

    /// Stop the background sweep; limiting itself keeps working
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for KeyedRateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(rate: f64, burst: u32) -> KeyedRateLimiterConfig {
        KeyedRateLimiterConfig {
            rate,
            burst,
            cleanup_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = KeyedRateLimiter::new(config(1.0, 2));

        assert!(limiter.allow("key1"));
        assert!(limiter.allow("key1"));
        assert!(!limiter.allow("key1"));

        assert!(limiter.allow("key2"));
        assert!(limiter.allow("key2"));
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bucket_created_once_under_contention() {
        let limiter = Arc::new(KeyedRateLimiter::new(config(0.0, 5)));
        let admitted = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..4 {
                    if limiter.allow("shared") {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 5);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_full_buckets() {
        let limiter = KeyedRateLimiter::new(config(10.0, 5));
        assert!(limiter.allow("a"));

        // Neither full nor idle yet
        assert_eq!(limiter.sweep(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.tokens("a"), Some(5.0));
        assert_eq!(limiter.sweep(), 1);
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_recently_used_full_bucket() {
        let limiter = KeyedRateLimiter::new(KeyedRateLimiterConfig {
            idle_timeout: Duration::from_secs(10),
            ..config(1_000.0, 5)
        });
        assert!(limiter.allow("a"));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(limiter.tokens("a"), Some(5.0));
        assert_eq!(limiter.sweep(), 0);
        assert!(limiter.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_partially_drained_bucket() {
        let limiter = KeyedRateLimiter::new(KeyedRateLimiterConfig {
            idle_timeout: Duration::ZERO,
            ..config(0.0, 5)
        });
        assert!(limiter.allow("a"));
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.tokens("a"), Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cleanup() {
        let limiter = KeyedRateLimiter::start(KeyedRateLimiterConfig {
            idle_timeout: Duration::ZERO,
            ..config(1_000.0, 1)
        });
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.len(), 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_stops_when_dropped() {
        let limiter = Arc::new(KeyedRateLimiter::new(config(1.0, 1)));
        let handle = limiter.spawn_cleanup();

        drop(limiter);
        let stopped = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_stops_on_shutdown() {
        let limiter = Arc::new(KeyedRateLimiter::new(config(1.0, 1)));
        let handle = limiter.spawn_cleanup();

        limiter.shutdown();
        let stopped = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(stopped.is_ok());
        assert!(limiter.allow("still-works"));
    }

    #[test]
    fn test_config_validation() {
        assert!(KeyedRateLimiterConfig::default().validate().is_ok());
        assert!(config(-1.0, 1).validate().is_err());
        assert!(config(1.0, 0).validate().is_err());
        assert!(KeyedRateLimiterConfig {
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
