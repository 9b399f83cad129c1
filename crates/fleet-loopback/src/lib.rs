//! In-process implementation of the fleet transport ports.
//!
//! A [`LoopbackConnector`] plays both sides of the wire: the fleet talks to it
//! through [`fleet_core::transport::port`], while tests and the developer
//! console drive the "phone" side (confirming pairing codes, injecting
//! messages, reading what the bot sent).

mod connection;
mod connector;
mod store;

pub use connection::{LoopbackConnection, Outbound};
pub use connector::LoopbackConnector;
pub use store::FileDeviceStore;
