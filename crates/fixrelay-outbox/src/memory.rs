//! In-process outbox.

use std::collections::{HashMap, VecDeque};

use fixrelay_core::{FixFields, OutboxEntry};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Outbox, OutboxError};

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<String>,
    entries: HashMap<String, FixFields>,
}

/// Outbox held in memory. Entries are lost when the process exits.
///
/// A single lock guards both the key order and the field-maps, so the two
/// never disagree.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    inner: Mutex<Inner>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// All queued keys, oldest first.
    pub async fn keys(&self) -> Vec<String> {
        self.inner.lock().await.order.iter().cloned().collect()
    }
}

impl Outbox for MemoryOutbox {
    async fn push(&self, entry: OutboxEntry) -> Result<OutboxEntry, OutboxError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(&entry.key) {
            return Err(OutboxError::DuplicateKey(entry.key));
        }
        inner.entries.insert(entry.key.clone(), entry.fields.clone());
        inner.order.push_back(entry.key.clone());
        debug!("Queued {} ({} pending)", entry.key, inner.order.len());
        Ok(entry)
    }

    async fn peek_oldest(&self) -> Result<Option<OutboxEntry>, OutboxError> {
        let inner = self.inner.lock().await;
        let Some(key) = inner.order.front() else {
            return Ok(None);
        };
        let fields = inner
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| OutboxError::MissingPayload(key.clone()))?;
        Ok(Some(OutboxEntry {
            key: key.clone(),
            fields,
        }))
    }

    async fn remove(&self, key: &str) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
        Ok(())
    }

    async fn len(&self) -> Result<usize, OutboxError> {
        Ok(self.inner.lock().await.order.len())
    }
}
