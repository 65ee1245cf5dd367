/*!
 * Error types for Ward
 */

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use ward_core_resilience::ConfigError;

pub type Result<T> = std::result::Result<T, WardError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum WardError {
    /// Config file could not be read or written
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A section holds values the primitives reject
    #[error("Invalid [{section}] configuration: {source}")]
    InvalidConfig {
        section: String,
        #[source]
        source: ConfigError,
    },

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] io::Error),
}

impl WardError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        // Every error surfaces before any protected work has started
        EXIT_FATAL
    }

    /// Check if this error comes from the user's configuration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            WardError::Parse(_) | WardError::InvalidConfig { .. }
        )
    }
}
