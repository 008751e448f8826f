//! Error types for agora-p2p.

use agora_core::StorageError;
use thiserror::Error;

/// Errors that can occur in gossip handling.
#[derive(Debug, Error)]
pub enum P2pError {
    /// A cached message was re-sent by a different origin peer.
    #[error("message {message_id} belongs to {stored}, refusing update from {received}")]
    ConflictingOrigin {
        /// The message being updated.
        message_id: String,
        /// Origin recorded for the cached message.
        stored: String,
        /// Origin claimed by the incoming update.
        received: String,
    },

    /// The message is structurally invalid.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Underlying storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
