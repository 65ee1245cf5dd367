/*!
 * Configuration types for Ward
 *
 * A `WardConfig` is loaded from TOML and converted into the library's policy
 * structs. Every section is optional; missing fields take the library defaults.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use ward_core_resilience::{
    BackoffStrategy, CircuitBreakerConfig, CircuitBreakerRegistry, ConfigError, ConstantBackoff,
    ExponentialBackoff, Jitter, KeyedRateLimiterConfig, LinearBackoff, RateLimiter, RetryConfig,
};

use crate::error::{Result, WardError};

/// Main configuration: one section per primitive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub breaker: BreakerSection,

    /// Process-wide limiter; absent means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSection>,

    #[serde(default)]
    pub keyed_rate_limit: KeyedRateLimitSection,

    #[serde(default)]
    pub retry: RetrySection,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

/// Default breaker policy plus per-dependency overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_max_half_open_requests")]
    pub max_half_open_requests: u32,

    /// Defaults to `max_half_open_requests`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, BreakerOverride>,
}

/// Fields left out fall back to the `[breaker]` values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_half_open_requests: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            open_timeout_ms: default_open_timeout_ms(),
            max_half_open_requests: default_max_half_open_requests(),
            success_threshold: None,
            dependencies: BTreeMap::new(),
        }
    }
}

impl BreakerSection {
    /// Policy for breakers without an override
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures: self.max_failures,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            max_half_open_requests: self.max_half_open_requests,
            success_threshold: self.success_threshold,
            ..Default::default()
        }
    }

    /// Policy for the breaker called `name`, with its override applied
    pub fn policy_for(&self, name: &str) -> CircuitBreakerConfig {
        let base = self.to_breaker_config();
        let Some(over) = self.dependencies.get(name) else {
            return base;
        };

        CircuitBreakerConfig {
            max_failures: over.max_failures.unwrap_or(base.max_failures),
            open_timeout: over
                .open_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.open_timeout),
            max_half_open_requests: over
                .max_half_open_requests
                .unwrap_or(base.max_half_open_requests),
            success_threshold: over.success_threshold.or(base.success_threshold),
            ..base
        }
    }

    pub fn to_registry(&self) -> CircuitBreakerRegistry {
        self.dependencies.keys().fold(
            CircuitBreakerRegistry::new(self.to_breaker_config()),
            |registry, name| {
                let policy = self.policy_for(name);
                registry.with_override(name.clone(), policy)
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Requests per second
    pub rate: f64,
    pub burst: u32,
}

impl RateLimitSection {
    pub fn build(&self) -> std::result::Result<RateLimiter, ConfigError> {
        RateLimiter::try_new(self.rate, self.burst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedRateLimitSection {
    #[serde(default = "default_keyed_rate")]
    pub rate: f64,

    #[serde(default = "default_keyed_burst")]
    pub burst: u32,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for KeyedRateLimitSection {
    fn default() -> Self {
        Self {
            rate: default_keyed_rate(),
            burst: default_keyed_burst(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl KeyedRateLimitSection {
    pub fn to_keyed_config(&self) -> KeyedRateLimiterConfig {
        KeyedRateLimiterConfig {
            rate: self.rate,
            burst: self.burst,
            cleanup_interval: Duration::from_millis(self.cleanup_interval_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
        }
    }
}

/// Backoff strategy, tagged by `strategy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum BackoffSection {
    Constant {
        delay_ms: u64,
    },
    Linear {
        initial_ms: u64,
        increment_ms: u64,
        max_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

impl Default for BackoffSection {
    fn default() -> Self {
        BackoffSection::Exponential {
            initial_ms: 100,
            max_ms: 30_000,
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffSection {
    pub fn to_strategy(&self) -> Arc<dyn BackoffStrategy> {
        match *self {
            BackoffSection::Constant { delay_ms } => {
                Arc::new(ConstantBackoff::new(Duration::from_millis(delay_ms)))
            }
            BackoffSection::Linear {
                initial_ms,
                increment_ms,
                max_ms,
            } => Arc::new(LinearBackoff {
                initial: Duration::from_millis(initial_ms),
                increment: Duration::from_millis(increment_ms),
                max: Duration::from_millis(max_ms),
            }),
            BackoffSection::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => Arc::new(ExponentialBackoff {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(max_ms),
                multiplier,
            }),
        }
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        match *self {
            BackoffSection::Constant { .. } => Ok(()),
            BackoffSection::Linear {
                initial_ms, max_ms, ..
            }
            | BackoffSection::Exponential {
                initial_ms, max_ms, ..
            } if max_ms < initial_ms => Err(ConfigError::invalid(
                "max_ms",
                format!("{max_ms} is below initial_ms ({initial_ms})"),
            )),
            BackoffSection::Exponential { multiplier, .. }
                if !multiplier.is_finite() || multiplier < 1.0 =>
            {
                Err(ConfigError::invalid(
                    "multiplier",
                    format!("{multiplier} must be a finite number >= 1.0"),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    #[serde(default)]
    pub backoff: BackoffSection,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
            jitter_factor: default_jitter_factor(),
            backoff: BackoffSection::default(),
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            backoff: self.backoff.to_strategy(),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Jitter {
                enabled: self.jitter,
                factor: self.jitter_factor,
            },
            ..Default::default()
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_max_failures() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_max_half_open_requests() -> u32 {
    3
}

fn default_keyed_rate() -> f64 {
    10.0
}

fn default_keyed_burst() -> u32 {
    20
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn invalid(section: impl Into<String>) -> impl FnOnce(ConfigError) -> WardError {
    let section = section.into();
    move |source| WardError::InvalidConfig { section, source }
}

impl WardConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| WardError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?).map_err(|source| WardError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the library would otherwise silently replace
    pub fn validate(&self) -> Result<()> {
        self.breaker
            .to_breaker_config()
            .validate()
            .map_err(invalid("breaker"))?;
        for name in self.breaker.dependencies.keys() {
            self.breaker
                .policy_for(name)
                .validate()
                .map_err(invalid(format!("breaker.dependencies.{name}")))?;
        }

        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.build().map_err(invalid("rate_limit"))?;
        }

        self.keyed_rate_limit
            .to_keyed_config()
            .validate()
            .map_err(invalid("keyed_rate_limit"))?;

        self.retry.backoff.validate().map_err(invalid("retry.backoff"))?;
        self.retry
            .to_retry_config()
            .validate()
            .map_err(invalid("retry"))?;

        Ok(())
    }

    /// Trip early, recover cautiously, retry little
    pub fn strict_preset() -> Self {
        Self {
            breaker: BreakerSection {
                max_failures: 3,
                open_timeout_ms: 60_000,
                max_half_open_requests: 1,
                ..Default::default()
            },
            rate_limit: Some(RateLimitSection {
                rate: 100.0,
                burst: 100,
            }),
            keyed_rate_limit: KeyedRateLimitSection {
                rate: 5.0,
                burst: 10,
                ..Default::default()
            },
            retry: RetrySection {
                max_attempts: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Tolerate noisy dependencies and bursty clients
    pub fn lenient_preset() -> Self {
        Self {
            breaker: BreakerSection {
                max_failures: 10,
                open_timeout_ms: 10_000,
                max_half_open_requests: 5,
                success_threshold: Some(2),
                ..Default::default()
            },
            keyed_rate_limit: KeyedRateLimitSection {
                rate: 50.0,
                burst: 100,
                ..Default::default()
            },
            retry: RetrySection {
                max_attempts: 5,
                backoff: BackoffSection::Exponential {
                    initial_ms: 50,
                    max_ms: 5_000,
                    multiplier: 2.0,
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
