//! In-memory provider implementations.
//!
//! [`InMemoryDurableStore`] backs tests and ephemeral deployments.
//! [`InMemorySharedKv`] models a shared KV + bus inside one process,
//! including a fault switch so tests can take the backend down and bring it
//! back. [`NullSharedKv`] is the do-nothing stand-in for deployments without
//! a shared backend.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{BatchOp, BusMessage, BusSubscription, DurableStore, SharedKv};
use crate::clock::{Clock as _, SharedClock};
use crate::error::{Error, Result};

/// Durable-store contract satisfied by a process-local ordered map.
///
/// Not durable across restarts, which is exactly what tests want; production
/// deployments use the redb implementation.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryDurableStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<()> {
        let mut entries = self.entries.lock();
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Fault switch for the in-memory shared KV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// All operations succeed
    Healthy,
    /// Every operation fails as if the backend were unreachable
    Down,
}

struct SharedEntry {
    value: Vec<u8>,
    expires_at: Duration,
}

/// In-process shared KV with TTLs and a broadcast bus.
pub struct InMemorySharedKv {
    entries: Mutex<HashMap<String, SharedEntry>>,
    bus: broadcast::Sender<BusMessage>,
    fault: Mutex<FaultMode>,
    clock: SharedClock,
}

impl InMemorySharedKv {
    /// Create a healthy shared KV.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        let (bus, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            bus,
            fault: Mutex::new(FaultMode::Healthy),
            clock,
        }
    }

    /// Flip the fault switch.
    pub fn set_fault(&self, mode: FaultMode) {
        *self.fault.lock() = mode;
        debug!(?mode, "in-memory shared kv fault mode changed");
    }

    fn check_up(&self) -> Result<()> {
        match *self.fault.lock() {
            FaultMode::Healthy => Ok(()),
            FaultMode::Down => Err(Error::Storage("shared kv unreachable".to_string())),
        }
    }
}

#[async_trait]
impl SharedKv for InMemorySharedKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_up()?;
        let now = self.clock.monotonic();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_up()?;
        let expires_at = self.clock.monotonic() + ttl;
        self.entries.lock().insert(
            key.to_string(),
            SharedEntry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.check_up()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_up()?;
        let now = self.clock.monotonic();
        let entries = self.entries.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && entry.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.check_up()?;
        // No subscribers is not an error, matching real bus semantics.
        let _ = self.bus.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<BusSubscription> {
        self.check_up()?;
        let wanted: Vec<String> = channels.iter().map(|c| (*c).to_string()).collect();
        let mut source = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if wanted.iter().any(|c| c == &message.channel)
                            && tx.send(message).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(BusSubscription { receiver: rx })
    }

    async fn ping(&self) -> Result<()> {
        self.check_up()
    }
}

/// Shared KV that stores nothing and delivers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSharedKv;

#[async_trait]
impl SharedKv for NullSharedKv {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn keys(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _channels: &[&str]) -> Result<BusSubscription> {
        // A closed stream: the adapter treats it as a bus that never speaks.
        let (_tx, rx) = mpsc::channel(1);
        Ok(BusSubscription { receiver: rx })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_durable_scan_is_key_ordered() {
        let store = InMemoryDurableStore::new();
        store.put("memory:episodic:b", b"2").await.unwrap();
        store.put("memory:episodic:a", b"1").await.unwrap();
        store.put("memory:semantic:x", b"3").await.unwrap();

        let hits = store.scan("memory:episodic:", 10).await.unwrap();
        let keys: Vec<&str> = hits.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["memory:episodic:a", "memory:episodic:b"]);
    }

    #[tokio::test]
    async fn test_durable_batch_applies_all() {
        let store = InMemoryDurableStore::new();
        store.put("stale", b"x").await.unwrap();
        store
            .apply_batch(vec![
                BatchOp::Put {
                    key: "fresh".to_string(),
                    value: b"y".to_vec(),
                },
                BatchOp::Delete {
                    key: "stale".to_string(),
                },
            ])
            .await
            .unwrap();
        assert!(store.get("stale").await.unwrap().is_none());
        assert_eq!(store.get("fresh").await.unwrap(), Some(b"y".to_vec()));
    }

    #[tokio::test]
    async fn test_shared_kv_ttl_expiry() {
        let clock = ManualClock::shared();
        let kv = InMemorySharedKv::new(clock.clone());
        kv.set("k", b"v", Duration::from_secs(10)).await.unwrap();
        assert!(kv.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(11));
        assert!(kv.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fault_mode_fails_everything() {
        let kv = InMemorySharedKv::new(ManualClock::shared());
        kv.set_fault(FaultMode::Down);
        assert!(kv.ping().await.is_err());
        assert!(kv.get("k").await.is_err());
        assert!(kv.set("k", b"v", Duration::from_secs(1)).await.is_err());

        kv.set_fault(FaultMode::Healthy);
        assert!(kv.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_pub_sub_delivers_to_subscribed_channels_only() {
        let kv = InMemorySharedKv::new(ManualClock::shared());
        let mut sub = kv.subscribe(&["agent:memory:episodic"]).await.unwrap();

        kv.publish("agent:memory:skill", b"skip").await.unwrap();
        kv.publish("agent:memory:episodic", b"take").await.unwrap();

        let message = sub.receiver.recv().await.unwrap();
        assert_eq!(message.channel, "agent:memory:episodic");
        assert_eq!(message.payload, b"take");
    }

    #[tokio::test]
    async fn test_null_shared_kv_is_silent() {
        let kv = NullSharedKv;
        kv.set("k", b"v", Duration::from_secs(1)).await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
        let mut sub = kv.subscribe(&["any"]).await.unwrap();
        assert!(sub.receiver.recv().await.is_none());
    }
}
