//! Error taxonomy for query execution.
//!
//! Store and provider internals report `anyhow::Error`; the engine, the
//! synthesizer, and the query boundary map those into [`QueryError`] so
//! callers (HTTP, CLI) can branch on the failure class.

use thiserror::Error;

/// A single text could not be embedded after every attempt was used.
#[derive(Debug, Clone, Error)]
#[error("embedding failed after {attempts} attempt(s): {message}")]
pub struct EmbeddingFailed {
    pub attempts: u32,
    pub message: String,
}

/// Failure classes surfaced by `execute_query`.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Malformed request. Raised before any external call.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The tenant has used up its query allowance.
    #[error("query quota exceeded for tenant {tenant}")]
    QuotaExceeded { tenant: String },

    #[error(transparent)]
    EmbeddingFailed(#[from] EmbeddingFailed),

    /// The generative completion service failed or timed out.
    #[error("completion service error: {0}")]
    UpstreamCompletion(String),

    /// The chunk or graph store was unreachable.
    #[error("store access error: {0}")]
    StoreAccess(String),
}

impl QueryError {
    pub fn validation(message: impl Into<String>) -> Self {
        QueryError::Validation(message.into())
    }

    /// Wrap a store failure, keeping the full context chain in the message.
    pub fn store(err: anyhow::Error) -> Self {
        QueryError::StoreAccess(format!("{:#}", err))
    }

    pub fn completion(err: anyhow::Error) -> Self {
        QueryError::UpstreamCompletion(format!("{:#}", err))
    }

    /// Stable machine-readable code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Validation(_) => "bad_request",
            QueryError::QuotaExceeded { .. } => "quota_exceeded",
            QueryError::EmbeddingFailed(_) => "embedding_failed",
            QueryError::UpstreamCompletion(_) => "upstream_error",
            QueryError::StoreAccess(_) => "store_unavailable",
        }
    }
}
