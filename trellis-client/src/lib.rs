//! Collaborator clients for trellis.
//!
//! The indexing core talks to three external services; this crate
//! defines the interfaces it consumes and ships production
//! implementations for each:
//!
//! - [`SparqlClient`] / [`HttpSparqlClient`]: the SPARQL endpoint with
//!   row-level authorization, plus the [`SparqlPool`] that scopes an
//!   authorized client to one closure
//! - [`SearchClient`] / [`ElasticClient`]: the Elasticsearch-compatible
//!   search backend
//! - [`TextExtractor`] / [`TikaExtractor`]: the text extraction service
//!   for binary attachments, with the content-addressed
//!   [`AttachmentCache`]
//!
//! The core depends on the traits only; tests substitute in-memory
//! fakes.

mod cache;
mod elastic;
mod error;
mod pool;
mod sparql;
mod term;
mod tika;

pub use cache::AttachmentCache;
pub use elastic::{BulkOperation, ElasticClient, SearchClient};
pub use error::{ClientError, Result};
pub use pool::{HttpClientFactory, SparqlClientFactory, SparqlPool};
pub use sparql::{Authorization, HttpSparqlClient, RetryPolicy, SparqlClient};
pub use term::{
    escape_string, Binding, ConstructTriple, ResultBindings, ResultHead, SelectResponse,
    SparqlTerm, TermKind,
};
pub use tika::{TextExtractor, TikaExtractor};
