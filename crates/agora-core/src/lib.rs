//! # agora-core
//!
//! Shared primitives for the Agora coordination SDK.
//!
//! This crate provides:
//!
//! - [`Storage`]: the asynchronous key-value contract every component persists through
//! - Storage backends: [`MemoryStorage`], [`JsonFileStorage`], [`ScopedStorage`]
//! - [`Clock`]: injected time source so timers and expiry checks agree in tests
//! - [`CoordinationConfig`]: TOML-loadable tuning values for gossip, queue and registry

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod storage;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock, SystemClock};
pub use config::{CoordinationConfig, GossipConfig, QueueConfig, RegistryConfig};
pub use error::{ConfigError, StorageError};
pub use storage::{
    BoxFuture, JsonFileStorage, MemoryStorage, ScopedStorage, SharedStorage, Storage, StorageExt,
};
