//! Error types for trellis-client.
//!
//! These cover the transport-level failures of the collaborator
//! services. Transient triplestore failures are retried before they
//! surface; what escapes here is treated by the callers as a task
//! failure for the resource at hand.

use thiserror::Error;

/// Result type alias using ClientError
pub type Result<T> = std::result::Result<T, ClientError>;

/// Collaborator transport errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level failure (connection, timeout, protocol)
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status from a collaborator
    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The response body could not be parsed as expected
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Local filesystem failure (attachment files, cache)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Network(err.to_string())
    }
}

impl ClientError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
