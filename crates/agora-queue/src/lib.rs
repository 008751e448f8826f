//! # agora-queue
//!
//! Durable deferred work for the Agora coordination SDK.
//!
//! Jobs are named after the handler that processes them, persisted through an
//! injected [`Storage`](agora_core::Storage), retried with a fixed delay and run
//! at most `concurrency_limit` at a time. A [`JobScheduler`] constructed over
//! storage left behind by a crashed process picks up where it stopped.
//!
//! ```no_run
//! use agora_core::{MemoryStorage, QueueConfig, SystemClock};
//! use agora_queue::{Job, JobScheduler, NewJob};
//! use serde_json::json;
//!
//! async fn republish(job: Job) -> anyhow::Result<()> {
//!     println!("republishing {}", job.data);
//!     Ok(())
//! }
//!
//! # async fn example() -> Result<(), agora_queue::QueueError> {
//! let scheduler =
//!     JobScheduler::start(MemoryStorage::shared(), SystemClock::shared(), QueueConfig::default())
//!         .await?;
//! scheduler.register_handler("republish", republish);
//! scheduler.add(NewJob::new("republish", json!({"request": "r1"})).max_retries(3)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handler;
pub mod job;
pub mod scheduler;

pub use error::QueueError;
pub use handler::JobHandler;
pub use job::{Job, JobState, NewJob};
pub use scheduler::{JobEvent, JobScheduler};
