//! Error types for agora-queue.

use agora_core::StorageError;
use thiserror::Error;

/// Errors returned by the job scheduler.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job cannot be accepted as submitted.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The scheduler has been stopped.
    #[error("scheduler is stopped")]
    Stopped,

    /// Underlying storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
