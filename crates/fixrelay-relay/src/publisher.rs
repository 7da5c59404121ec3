//! Outbox drain loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fixrelay_outbox::Outbox;
use fixrelay_protocol::encode_fix_payload;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{PublishError, RelayError};

/// Delivery of payloads to the broker.
pub trait Publisher: Send + Sync {
    /// Publish at QoS 1. Resolves once the broker acknowledged the message.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Disconnect cleanly.
    fn close(&self) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// Moves outbox entries to the broker, oldest first.
///
/// An entry is removed only after its publish succeeded, so a crash in
/// between republishes it on the next run.
pub struct RelayPublisher<O: Outbox, P: Publisher> {
    outbox: Arc<O>,
    publisher: P,
    topic: String,
    poll_interval: Duration,
}

impl<O: Outbox, P: Publisher> RelayPublisher<O, P> {
    pub fn new(outbox: Arc<O>, publisher: P, topic: String, poll_interval: Duration) -> Self {
        Self {
            outbox,
            publisher,
            topic,
            poll_interval,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Relay the head of the outbox, if any.
    ///
    /// Returns the key of the relayed entry, or `None` when the outbox is
    /// empty. On error the entry stays queued.
    pub async fn relay_next(&self) -> Result<Option<String>, RelayError> {
        let Some(entry) = self.outbox.peek_oldest().await? else {
            return Ok(None);
        };

        let payload = encode_fix_payload(&entry)?;
        debug!("Publishing {} ({} bytes)", entry.key, payload.len());
        self.publisher.publish(&self.topic, payload).await?;
        info!("Published {} to {}", entry.key, self.topic);

        self.outbox.remove(&entry.key).await?;
        Ok(Some(entry.key))
    }

    /// Drain the outbox until `shutdown` fires, then close the publisher.
    ///
    /// Shutdown is checked between entries; an in-flight publish is allowed
    /// to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.outbox.len().await {
            Ok(pending) => info!("Relaying to {} ({} entries pending)", self.topic, pending),
            Err(e) => warn!("Relaying to {} (pending count unavailable: {})", self.topic, e),
        }

        while !stopping(&shutdown) {
            match self.relay_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(RelayError::Publish(e)) => warn!("Publish failed, will retry: {}", e),
                Err(e) => error!("Relay failed: {}", e),
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Stopping relay");
        if let Err(e) = self.publisher.close().await {
            warn!("Failed to close publisher: {}", e);
        }
    }
}

/// True once shutdown was requested or its sender is gone.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}
