//! # agora-p2p
//!
//! Gossip-facing plumbing for the Agora coordination SDK.
//!
//! This crate provides:
//!
//! - [`MessageDedupCache`]: versioned, expiring de-duplication of gossip messages
//! - [`GossipTransport`]: the publish/subscribe contract the SDK consumes
//! - [`LocalGossipBus`]: an in-process transport with optional duplicate delivery

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dedup;
pub mod error;
pub mod transport;

pub use dedup::{CachedMessage, MessageDedupCache, PruneHandle, SetOutcome};
pub use error::P2pError;
pub use transport::{GossipMessage, GossipTransport, LocalGossipBus, LocalPeer};
