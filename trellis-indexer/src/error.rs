//! Error types for trellis-indexer.
//!
//! These errors stay internal to the indexing pipeline: the public
//! operations of the index manager catch and log them, returning
//! indexes (possibly invalid) rather than propagating failures to
//! callers.

use thiserror::Error;
use trellis_client::ClientError;

/// Result type alias using IndexerError
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Indexing pipeline errors
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Collaborator transport failure
    #[error(transparent)]
    Client(#[from] ClientError),

    /// An index type name is not present in the configuration
    #[error("unknown index type: {0}")]
    UnknownType(String),

    /// A resource lacks the uuid its document id derives from
    #[error("resource has no uuid: {0}")]
    MissingUuid(String),

    /// Merging composite sub-documents hit incompatible values
    #[error("incompatible values for field {field}")]
    MergeConflict { field: String },
}
