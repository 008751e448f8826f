//! # agora-market
//!
//! Request and offer bookkeeping for the Agora marketplace.
//!
//! This crate provides:
//!
//! - [`RequestRecord`] and [`OfferRecord`]: the records peers gossip about
//! - [`RequestReconciler`]: node-side debouncing of request announcements into one
//!   event per request
//! - [`RequestRegistry`]: client-side, persisted registry of published requests and
//!   the offers they received

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod offer;
pub mod reconciler;
pub mod registry;
pub mod request;

pub use error::MarketError;
pub use offer::{CancelOption, OfferRecord, PaymentOption};
pub use reconciler::{ReconcileOutcome, ReconciledRequest, RequestReconciler};
pub use registry::{ClientRequestEntry, RegistryChange, RequestRegistry};
pub use request::RequestRecord;
