//! Error types for trellis-config

use thiserror::Error;

/// Result type alias using ConfigError
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration errors. All validation problems are aggregated into a
/// single `Invalid` report so an operator sees every mistake at once.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration document is not valid JSON
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration parsed but failed validation
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}
