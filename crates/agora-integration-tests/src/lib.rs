//! Integration test crate for the Agora coordination SDK.
//!
//! This crate exists solely to run tests that span several Agora crates.
//! It has no public API; all functionality is in the test modules.

#![forbid(unsafe_code)]
