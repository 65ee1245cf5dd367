/*!
 * Ward - resilience policies for calls to downstream dependencies
 *
 * Builds the `ward-core-resilience` primitives from a TOML policy file:
 * - Circuit breakers per named dependency, with per-dependency overrides
 * - A process-wide token bucket and per-client buckets
 * - Retries with constant, linear or exponential backoff and jitter
 * - A `Guard` that composes all of them into one call path
 */

pub mod config;
pub mod error;
pub mod guard;
pub mod logging;

/// The primitives, re-exported for callers that only depend on `ward`
pub use ward_core_resilience as resilience;

// Re-export commonly used types
pub use config::{LogLevel, LoggingConfig, WardConfig};
pub use error::{Result, WardError};
pub use guard::{Guard, GuardSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
