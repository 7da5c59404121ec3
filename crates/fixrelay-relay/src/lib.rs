//! # fixrelay-relay
//!
//! Relays queued fixes to an MQTT broker.
//!
//! The [`RelayPublisher`] drains the outbox head first and removes an entry
//! only after the [`Publisher`] confirmed delivery. The MQTT implementation
//! ([`MqttPublisher`], feature `mqtt`, default) waits for the broker's PUBACK
//! before reporting success.

use std::time::Duration;

use fixrelay_outbox::OutboxError;
use fixrelay_protocol::CodecError;
use thiserror::Error;

#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod publisher;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttPublisher;
pub use publisher::{Publisher, RelayPublisher};

/// Errors from publishing to the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    /// TLS material could not be loaded.
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// The client request queue rejected the publish.
    #[error("MQTT client error: {0}")]
    Client(String),

    /// No acknowledgement within the timeout.
    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),

    /// The connection task is gone.
    #[error("Connection closed")]
    Closed,
}

/// Errors from relaying one outbox entry.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}
