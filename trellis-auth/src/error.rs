//! Error types for trellis-auth

use thiserror::Error;

/// Result type alias using AuthError
pub type Result<T> = std::result::Result<T, AuthError>;

/// Authorization-context errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// The allowed-groups payload could not be parsed
    #[error("invalid allowed-groups: {0}")]
    InvalidGroups(String),
}
