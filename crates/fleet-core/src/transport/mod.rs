//! Transport boundary: the chat wire protocol lives behind these ports.

pub mod port;
pub mod types;
