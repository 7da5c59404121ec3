//! # fixrelay-protocol
//!
//! Message formats for relaying fixes to the cloud broker.
//!
//! This crate defines the MQTT topic layout and the JSON payload built from
//! an outbox entry.

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
