//! # Agentmem Storage - Redis
//!
//! Redis as the optional shared KV + bus of the memory substrate.
//!
//! This crate provides:
//! - Per-key TTL writes (`SET ... EX`) matching the tier TTL table
//! - `PUBLISH`/`SUBSCRIBE` delivery of change events between instances
//! - A round-robin pool of multiplexed connections with automatic reconnect
//! - `PING`-based health probes consumed by the adapter's fallback logic
//!
//! The adapter treats every error here as a shared-backend failure and
//! falls back to durable-only service, so this crate maps Redis errors
//! plainly instead of retrying.
//!
//! ## Example
//!
//! ```no_run
//! use agentmem_storage_redis::RedisSharedKv;
//! use std::time::Duration;
//!
//! # async fn example() -> agentmem_core::Result<()> {
//! let kv = RedisSharedKv::connect("redis://127.0.0.1:6379", Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agentmem_core::backend::{BusMessage, BusSubscription, SharedKv};
use agentmem_core::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn map_err(context: &str, e: &redis::RedisError) -> Error {
    Error::Storage(format!("Redis {context} failed: {e}"))
}

/// Shared KV + bus over one Redis deployment.
///
/// Commands go through a round-robin pool of multiplexed
/// [`ConnectionManager`]s, each of which pipelines concurrent requests over
/// one reconnecting connection. Subscriptions get their own dedicated
/// connection each, as Redis requires.
pub struct RedisSharedKv {
    client: redis::Client,
    pool: Vec<ConnectionManager>,
    next: AtomicUsize,
}

impl std::fmt::Debug for RedisSharedKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedKv")
            .field("client", &self.client)
            .field("pool_size", &self.pool.len())
            .field("next", &self.next)
            .finish()
    }
}

impl RedisSharedKv {
    /// Connect a single-connection instance with a bounded connect timeout.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        Self::connect_pooled(url, 1, connect_timeout).await
    }

    /// Connect with a pool of up to `pool_size` command connections.
    pub async fn connect_pooled(
        url: &str,
        pool_size: usize,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid Redis URL: {e}")))?;

        let mut pool = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let manager =
                tokio::time::timeout(connect_timeout, ConnectionManager::new(client.clone()))
                    .await
                    .map_err(|_| {
                        Error::Storage(format!(
                            "Redis connect timed out after {connect_timeout:?}"
                        ))
                    })?
                    .map_err(|e| map_err("connect", &e))?;
            pool.push(manager);
        }

        info!(pool_size = pool.len(), "connected to Redis shared KV");
        Ok(Self {
            client,
            pool,
            next: AtomicUsize::new(0),
        })
    }

    fn conn(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[index].clone()
    }
}

#[async_trait]
impl SharedKv for RedisSharedKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(|e| map_err("GET", &e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let ttl_secs = ttl.as_secs().max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_err("SET", &e))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await.map_err(|e| map_err("DEL", &e))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut keys: Vec<String> = conn
            .keys(&pattern)
            .await
            .map_err(|e| map_err("KEYS", &e))?;
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| map_err("PUBLISH", &e))
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<BusSubscription> {
        // Subscriptions hijack their connection, so each gets a fresh one.
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| map_err("SUBSCRIBE connect", &e))?;
        let mut pubsub = conn.into_pubsub();
        for channel in channels {
            pubsub
                .subscribe(*channel)
                .await
                .map_err(|e| map_err("SUBSCRIBE", &e))?;
        }
        debug!(channels = channels.len(), "subscribed to Redis channels");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let channel = message.get_channel_name().to_string();
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(BusMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
            debug!("Redis pub/sub stream ended");
        });

        Ok(BusSubscription { receiver: rx })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| map_err("PING", &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let err = RedisSharedKv::connect("not a url", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_times_out() {
        // TEST-NET-1 address; nothing listens there.
        let err = RedisSharedKv::connect("redis://192.0.2.1:6379", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}

// Integration tests against a live server live in tests/live_redis.rs and
// are ignored unless AGENTMEM_REDIS_URL is set.
