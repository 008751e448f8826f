//! Error types for agora-market.

use thiserror::Error;

/// Errors that can occur in request and offer bookkeeping.
#[derive(Debug, Error)]
pub enum MarketError {
    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The offer is malformed.
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    /// No request with this id is registered.
    #[error("request not found: {0}")]
    RequestNotFound(String),

    /// A request with this id is already registered.
    #[error("request already registered: {0}")]
    DuplicateRequest(String),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
