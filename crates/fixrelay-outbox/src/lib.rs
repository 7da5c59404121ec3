//! # fixrelay-outbox
//!
//! Ordered handoff of completed fixes from BLE ingestion to the MQTT relay.
//!
//! Entries are keyed by fix date and time and kept in insertion order. The
//! relay reads the head of the queue and removes an entry only after the
//! broker acknowledged it, so a crash between publish and removal leads to a
//! duplicate publish, never to a lost fix.
//!
//! Backends:
//! - [`MemoryOutbox`] - in-process, not durable
//! - [`RedisOutbox`] - Redis list + hashes (feature `redis-backend`, default)

use std::future::Future;

use fixrelay_core::{FixRecord, OutboxEntry};
use thiserror::Error;
use tracing::debug;

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis_store;

pub use memory::MemoryOutbox;
#[cfg(feature = "redis-backend")]
pub use redis_store::RedisOutbox;

/// How often `enqueue` moves a clashing key before giving up.
pub const MAX_KEY_BUMPS: usize = 64;

/// Errors returned by outbox operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    /// An entry with this key is already queued.
    #[error("Duplicate outbox key: {0}")]
    DuplicateKey(String),

    /// The key is indexed but its field-map is gone.
    #[error("Outbox entry has no payload: {0}")]
    MissingPayload(String),

    /// The backing store failed.
    #[error("Outbox backend error: {0}")]
    Backend(String),
}

/// FIFO store of fixes waiting to be relayed.
///
/// Shared between the ingestion and relay sides as `Arc<impl Outbox>`.
pub trait Outbox: Send + Sync + 'static {
    /// Append an entry. Fails with [`OutboxError::DuplicateKey`] if the key
    /// is already queued; the stored entry is left untouched.
    fn push(&self, entry: OutboxEntry) -> impl Future<Output = Result<OutboxEntry, OutboxError>> + Send;

    /// Head of the queue, without removing it.
    fn peek_oldest(&self) -> impl Future<Output = Result<Option<OutboxEntry>, OutboxError>> + Send;

    /// Delete an entry and its index slot. Removing an absent key is a no-op.
    fn remove(&self, key: &str) -> impl Future<Output = Result<(), OutboxError>> + Send;

    /// Number of queued entries.
    fn len(&self) -> impl Future<Output = Result<usize, OutboxError>> + Send;

    /// Queue a completed fix under its date-time key.
    ///
    /// If the key is taken, typically by a second receiver reporting the
    /// same instant, the key is moved forward one microsecond at a time.
    /// The returned entry carries the key actually used.
    fn enqueue(&self, fix: &FixRecord) -> impl Future<Output = Result<OutboxEntry, OutboxError>> + Send {
        let mut entry = OutboxEntry::from_fix(fix);
        async move {
            for _ in 0..MAX_KEY_BUMPS {
                match self.push(entry.clone()).await {
                    Err(OutboxError::DuplicateKey(key)) => {
                        debug!("Outbox key {} taken", key);
                        if !entry.bump_key() {
                            return Err(OutboxError::DuplicateKey(key));
                        }
                    }
                    result => return result,
                }
            }
            Err(OutboxError::DuplicateKey(entry.key))
        }
    }
}
