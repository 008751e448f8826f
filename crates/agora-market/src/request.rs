//! Marketplace requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MarketError;

/// A client's request for service, as gossiped to suppliers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Unique request identifier.
    pub id: String,
    /// Topic the request is published on.
    pub topic: String,
    /// Application-defined query.
    pub query: Value,
    /// Unix timestamp (seconds) at which the request expires.
    pub expire: i64,
    /// Version counter; strictly increases on every update.
    pub nonce: u64,
}

impl RequestRecord {
    /// Creates a first-version request with a generated id.
    pub fn new(topic: impl Into<String>, query: Value, expire: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            query,
            expire,
            nonce: 1,
        }
    }

    /// Replaces the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the version counter.
    #[must_use]
    pub const fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// A request whose expiry is at or before `now_secs` is expired.
    #[must_use]
    pub const fn is_expired(&self, now_secs: i64) -> bool {
        self.expire <= now_secs
    }

    /// Checks the structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidRequest`] for an empty id or a zero nonce.
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.id.trim().is_empty() {
            return Err(MarketError::InvalidRequest("request id is empty".to_string()));
        }
        if self.nonce == 0 {
            return Err(MarketError::InvalidRequest(format!(
                "request {} has nonce 0",
                self.id
            )));
        }
        Ok(())
    }

    /// Encodes the request for publication.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, MarketError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes and validates a published request.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid request.
    pub fn decode(bytes: &[u8]) -> Result<Self, MarketError> {
        let request: Self = serde_json::from_slice(bytes)?;
        request.validate()?;
        Ok(request)
    }
}
