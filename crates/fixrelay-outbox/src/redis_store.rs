//! Redis-backed outbox.
//!
//! Layout:
//! - `<list_key>` - list of entry keys, oldest at the head
//! - `<entry_prefix>:<key>` - hash holding the entry's fix fields
//!
//! Enqueue runs as one Lua script and removal as one MULTI/EXEC block, so the
//! list and the hashes never diverge, even if the process dies mid-operation.

use std::collections::BTreeMap;

use fixrelay_core::OutboxEntry;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::{Outbox, OutboxError};

/// KEYS[1] = list, KEYS[2] = entry hash, ARGV[1] = entry key,
/// ARGV[2..] = field/value pairs. Returns 0 if the entry already exists.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
redis.call('HSET', KEYS[2], unpack(ARGV, 2))
redis.call('RPUSH', KEYS[1], ARGV[1])
return 1
"#;

impl From<redis::RedisError> for OutboxError {
    fn from(e: redis::RedisError) -> Self {
        OutboxError::Backend(e.to_string())
    }
}

/// Outbox stored in Redis, durable across restarts.
#[derive(Clone)]
pub struct RedisOutbox {
    connection: MultiplexedConnection,
    list_key: String,
    entry_prefix: String,
    enqueue_script: Script,
}

impl RedisOutbox {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, list_key: &str, entry_prefix: &str) -> Result<Self, OutboxError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        let outbox = Self {
            connection,
            list_key: list_key.to_string(),
            entry_prefix: entry_prefix.to_string(),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
        };

        let pending = outbox.len().await?;
        info!("Connected to outbox store ({} entries pending)", pending);
        Ok(outbox)
    }

    fn entry_name(&self, key: &str) -> String {
        entry_name(&self.entry_prefix, key)
    }
}

/// Hash name for an entry key.
fn entry_name(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

impl Outbox for RedisOutbox {
    async fn push(&self, entry: OutboxEntry) -> Result<OutboxEntry, OutboxError> {
        let mut connection = self.connection.clone();
        let mut invocation = self.enqueue_script.prepare_invoke();
        invocation
            .key(&self.list_key)
            .key(self.entry_name(&entry.key))
            .arg(&entry.key);
        for (field, value) in &entry.fields {
            invocation.arg(field).arg(value);
        }

        let inserted: i32 = invocation.invoke_async(&mut connection).await?;
        if inserted == 0 {
            return Err(OutboxError::DuplicateKey(entry.key));
        }
        debug!("Queued {}", entry.key);
        Ok(entry)
    }

    async fn peek_oldest(&self) -> Result<Option<OutboxEntry>, OutboxError> {
        let mut connection = self.connection.clone();
        let key: Option<String> = connection.lindex(&self.list_key, 0).await?;
        let Some(key) = key else {
            return Ok(None);
        };

        let fields: BTreeMap<String, String> = connection.hgetall(self.entry_name(&key)).await?;
        if fields.is_empty() {
            return Err(OutboxError::MissingPayload(key));
        }
        Ok(Some(OutboxEntry { key, fields }))
    }

    async fn remove(&self, key: &str) -> Result<(), OutboxError> {
        let mut connection = self.connection.clone();
        redis::pipe()
            .atomic()
            .del(self.entry_name(key))
            .ignore()
            .lrem(&self.list_key, 0, key)
            .ignore()
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, OutboxError> {
        let mut connection = self.connection.clone();
        let len: usize = connection.llen(&self.list_key).await?;
        Ok(len)
    }
}
