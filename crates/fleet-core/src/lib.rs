//! Core domain + application logic for the multi-session bot fleet.
//!
//! This crate is intentionally framework-agnostic. The chat wire protocol lives
//! behind ports (traits) in [`transport::port`], implemented in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod fleet;
pub mod identity;
pub mod logging;
pub mod notify;
pub mod pairing;
pub mod persist;
pub mod registry;
pub mod router;
pub mod settings;
pub mod tasks;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, PairingError, Result};
