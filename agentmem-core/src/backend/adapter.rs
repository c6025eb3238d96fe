//! Dual-write backend adapter.
//!
//! Writes land in the durable store first (under the caller's write lock),
//! then mirror best-effort into the shared KV with the tier TTL, then publish
//! a change event. Mirror or publish failures never fail the operation; they
//! are counted, logged, and after enough consecutive failures the shared
//! backend is declared unhealthy and skipped until a probe succeeds.
//!
//! Reads go cache -> shared KV -> durable store, repopulating the faster
//! layers on the way back. Undecodable durable entries are quarantined.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BusMessage, DurableStore, EventOp, MemoryEvent, MemoryTier, SharedKv, channels, keys,
};
use crate::cache::{BoundedTtlCache, CacheMetrics};
use crate::clock::SharedClock;
use crate::codec::PayloadCodec;
use crate::config::MemoryConfig;
use crate::error::{Error, Result};

/// Health of the shared backend as seen by one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    /// Shared KV reachable and in use
    Healthy,
    /// Shared KV failing; serving from durable + local cache only
    Unhealthy,
    /// No shared KV configured
    Disabled,
}

/// Infrastructure counters for one adapter instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStats {
    /// Writes committed to the durable store
    pub durable_writes: u64,
    /// Reads answered by the durable store
    pub durable_reads: u64,
    /// Reads answered by the local cache
    pub cache_hits: u64,
    /// Reads answered by the shared KV
    pub shared_hits: u64,
    /// Successful shared-KV mirrors
    pub mirror_writes: u64,
    /// Failed shared-KV mirrors
    pub mirror_failures: u64,
    /// Events published on the bus
    pub events_published: u64,
    /// Publish attempts that failed
    pub publish_failures: u64,
    /// Events received from peers
    pub events_received: u64,
    /// Events dropped because this instance originated them
    pub events_ignored: u64,
    /// Cache invalidations triggered by peer events
    pub peer_invalidations: u64,
    /// Healthy -> unhealthy transitions
    pub fallback_transitions: u64,
    /// Unhealthy -> healthy transitions
    pub recoveries: u64,
    /// Durable entries quarantined as corrupt
    pub quarantined: u64,
}

#[derive(Debug)]
struct HealthState {
    healthy: bool,
    consecutive_failures: u32,
}

/// Storage composition used by every store in the substrate.
pub struct BackendAdapter {
    instance_id: Uuid,
    durable: Arc<dyn DurableStore>,
    shared: Option<Arc<dyn SharedKv>>,
    codec: PayloadCodec,
    cache: BoundedTtlCache<Vec<u8>>,
    health: Mutex<HealthState>,
    stats: Mutex<AdapterStats>,
    ttls: crate::config::TierTtls,
    fail_threshold: u32,
    probe_interval: Duration,
}

impl BackendAdapter {
    /// Compose an adapter over a durable store and an optional shared KV.
    #[must_use]
    pub fn new(
        durable: Arc<dyn DurableStore>,
        shared: Option<Arc<dyn SharedKv>>,
        config: &MemoryConfig,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: Uuid::new_v4(),
            durable,
            shared,
            codec: PayloadCodec::new(config.compression_threshold_bytes, config.max_payload_bytes),
            cache: BoundedTtlCache::new(config.cache_size, config.cache_ttl, clock),
            health: Mutex::new(HealthState {
                healthy: true,
                consecutive_failures: 0,
            }),
            stats: Mutex::new(AdapterStats::default()),
            ttls: config.ttls,
            fail_threshold: config.shared_kv.unhealthy_fail_threshold,
            probe_interval: config.shared_kv.probe_interval,
        })
    }

    /// Identifier embedded in published events for self-deduplication.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Current shared-backend health.
    #[must_use]
    pub fn health(&self) -> BackendHealth {
        if self.shared.is_none() {
            return BackendHealth::Disabled;
        }
        if self.health.lock().healthy {
            BackendHealth::Healthy
        } else {
            BackendHealth::Unhealthy
        }
    }

    /// Infrastructure counters snapshot.
    #[must_use]
    pub fn stats(&self) -> AdapterStats {
        self.stats.lock().clone()
    }

    /// Local cache counters snapshot.
    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    fn shared_if_usable(&self) -> Option<&Arc<dyn SharedKv>> {
        let shared = self.shared.as_ref()?;
        if self.health.lock().healthy {
            Some(shared)
        } else {
            None
        }
    }

    fn record_shared_failure(&self, context: &str, error: &Error) {
        let mut health = self.health.lock();
        health.consecutive_failures += 1;
        warn!(
            context,
            error = %error,
            consecutive_failures = health.consecutive_failures,
            "shared backend operation failed"
        );
        if health.healthy && health.consecutive_failures >= self.fail_threshold {
            health.healthy = false;
            self.stats.lock().fallback_transitions += 1;
            warn!(
                instance_id = %self.instance_id,
                "shared backend declared unhealthy, serving durable + local cache only"
            );
        }
    }

    fn record_shared_success(&self) {
        let mut health = self.health.lock();
        health.consecutive_failures = 0;
        if !health.healthy {
            health.healthy = true;
            self.stats.lock().recoveries += 1;
            info!(instance_id = %self.instance_id, "shared backend recovered");
        }
    }

    /// Write a record durably, mirror it best-effort, and cache it locally.
    pub async fn put_record<T: Serialize + Sync>(
        &self,
        key: &str,
        tier: MemoryTier,
        value: &T,
    ) -> Result<()> {
        let framed = self.codec.encode_record(value)?;
        self.durable.put(key, &framed).await?;
        self.stats.lock().durable_writes += 1;
        self.cache.put(key, framed.clone());
        self.mirror(key, tier, &framed).await;
        Ok(())
    }

    /// Mirror a value into the shared KV only, best-effort.
    ///
    /// Used by ephemeral tiers (working steps, session records) that never
    /// land in the durable store but are still shared with peers under
    /// their tier TTL.
    pub async fn mirror_record<T: Serialize + Sync>(&self, key: &str, tier: MemoryTier, value: &T) {
        match self.codec.encode_record(value) {
            Ok(framed) => self.mirror(key, tier, &framed).await,
            Err(e) => warn!(key, error = %e, "failed to encode mirrored value"),
        }
    }

    async fn mirror(&self, key: &str, tier: MemoryTier, framed: &[u8]) {
        let Some(shared) = self.shared_if_usable() else {
            return;
        };
        match shared.set(key, framed, tier.ttl(&self.ttls)).await {
            Ok(()) => {
                self.record_shared_success();
                self.stats.lock().mirror_writes += 1;
            }
            Err(e) => {
                self.stats.lock().mirror_failures += 1;
                self.record_shared_failure("mirror", &e);
            }
        }
    }

    /// Read a record through cache, shared KV, and durable store.
    pub async fn get_record<T: DeserializeOwned>(
        &self,
        key: &str,
        tier: MemoryTier,
    ) -> Result<Option<T>> {
        if let Some(framed) = self.cache.get(key) {
            match self.codec.decode_record(&framed) {
                Ok(value) => {
                    self.stats.lock().cache_hits += 1;
                    return Ok(Some(value));
                }
                Err(_) => self.cache.invalidate(key),
            }
        }

        if let Some(shared) = self.shared_if_usable() {
            match shared.get(key).await {
                Ok(Some(framed)) => {
                    self.record_shared_success();
                    match self.codec.decode_record(&framed) {
                        Ok(value) => {
                            self.stats.lock().shared_hits += 1;
                            self.cache.put(key, framed);
                            return Ok(Some(value));
                        }
                        Err(e) => {
                            warn!(key, error = %e, "undecodable shared-KV entry, dropping");
                            let _ = shared.del(key).await;
                        }
                    }
                }
                Ok(None) => self.record_shared_success(),
                Err(e) => self.record_shared_failure("read", &e),
            }
        }

        match self.durable.get(key).await? {
            None => Ok(None),
            Some(framed) => {
                self.stats.lock().durable_reads += 1;
                match self.codec.decode_record(&framed) {
                    Ok(value) => {
                        self.cache.put(key, framed.clone());
                        self.mirror(key, tier, &framed).await;
                        Ok(Some(value))
                    }
                    Err(e) => {
                        self.quarantine(key, &framed).await;
                        Err(Error::Corruption(format!(
                            "durable entry {key} failed validation: {e}"
                        )))
                    }
                }
            }
        }
    }

    async fn quarantine(&self, key: &str, framed: &[u8]) {
        let quarantine_key = format!("{}{key}", keys::QUARANTINE_PREFIX);
        warn!(key, quarantine_key = %quarantine_key, "quarantining corrupt durable entry");
        if let Err(e) = self.durable.put(&quarantine_key, framed).await {
            warn!(key, error = %e, "failed to store quarantined entry");
        }
        if let Err(e) = self.durable.delete(key).await {
            warn!(key, error = %e, "failed to remove corrupt entry");
        }
        self.cache.invalidate(key);
        self.stats.lock().quarantined += 1;
    }

    /// Delete a record everywhere; returns whether the durable copy existed.
    pub async fn delete_record(&self, key: &str) -> Result<bool> {
        let existed = self.durable.delete(key).await?;
        self.cache.invalidate(key);
        if let Some(shared) = self.shared_if_usable() {
            if let Err(e) = shared.del(key).await {
                self.record_shared_failure("delete", &e);
            } else {
                self.record_shared_success();
            }
        }
        Ok(existed)
    }

    /// Scan and decode durable records under a key prefix, ascending by key.
    ///
    /// Corrupt entries are quarantined and skipped so one bad record cannot
    /// hide the rest of the tier.
    pub async fn scan_records<T: DeserializeOwned>(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, T)>> {
        let raw = self.durable.scan(prefix, limit).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (key, framed) in raw {
            match self.codec.decode_record(&framed) {
                Ok(value) => out.push((key, value)),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping corrupt entry during scan");
                    self.quarantine(&key, &framed).await;
                }
            }
        }
        Ok(out)
    }

    /// Apply an atomic durable batch of records, then fix up caches.
    pub async fn apply_batch(&self, batch: Vec<super::BatchOp>) -> Result<()> {
        let touched: Vec<String> = batch
            .iter()
            .map(|op| match op {
                super::BatchOp::Put { key, .. } | super::BatchOp::Delete { key } => key.clone(),
            })
            .collect();
        self.durable.apply_batch(batch).await?;
        self.stats.lock().durable_writes += 1;
        for key in touched {
            self.cache.invalidate(&key);
            if let Some(shared) = self.shared_if_usable() {
                if let Err(e) = shared.del(&key).await {
                    self.record_shared_failure("batch-invalidate", &e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Publish a change event on a channel, best-effort.
    pub async fn publish_event(&self, channel: &str, op: EventOp, id: &str) {
        let Some(shared) = self.shared_if_usable() else {
            return;
        };
        let event = MemoryEvent {
            op,
            id: id.to_string(),
            source_instance: self.instance_id,
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize memory event");
                return;
            }
        };
        match shared.publish(channel, &payload).await {
            Ok(()) => {
                self.record_shared_success();
                self.stats.lock().events_published += 1;
            }
            Err(e) => {
                self.stats.lock().publish_failures += 1;
                self.record_shared_failure("publish", &e);
            }
        }
    }

    /// Drop a key from the local cache.
    pub fn invalidate_local(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Drop every locally cached key under a prefix.
    pub fn invalidate_local_prefix(&self, prefix: &str) {
        self.cache.invalidate_prefix(prefix);
    }

    /// Ping the shared backend once, updating health state.
    pub async fn probe_now(&self) -> BackendHealth {
        let Some(shared) = self.shared.as_ref() else {
            return BackendHealth::Disabled;
        };
        match shared.ping().await {
            Ok(()) => self.record_shared_success(),
            Err(e) => self.record_shared_failure("probe", &e),
        }
        self.health()
    }

    /// Spawn the background probe that recovers an unhealthy shared backend.
    pub fn start_health_probe(self: Arc<Self>) -> JoinHandle<()> {
        let adapter = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(adapter.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if adapter.health() == BackendHealth::Unhealthy {
                    let _ = adapter.probe_now().await;
                }
            }
        })
    }

    /// Spawn the bus listener that invalidates caches on peer events.
    pub fn start_event_listener(self: Arc<Self>) -> JoinHandle<()> {
        let adapter = self;
        tokio::spawn(async move {
            loop {
                let Some(shared) = adapter.shared.as_ref() else {
                    return;
                };
                match shared.subscribe(&channels::ALL).await {
                    Ok(mut subscription) => {
                        debug!(instance_id = %adapter.instance_id, "bus listener subscribed");
                        while let Some(message) = subscription.receiver.recv().await {
                            adapter.handle_bus_message(&message);
                        }
                        warn!("bus subscription closed, resubscribing");
                    }
                    Err(e) => {
                        adapter.record_shared_failure("subscribe", &e);
                    }
                }
                tokio::time::sleep(adapter.probe_interval).await;
            }
        })
    }

    fn handle_bus_message(&self, message: &BusMessage) {
        let event: MemoryEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "undecodable bus event");
                return;
            }
        };
        let mut stats = self.stats.lock();
        stats.events_received += 1;
        if event.source_instance == self.instance_id {
            stats.events_ignored += 1;
            return;
        }
        stats.peer_invalidations += 1;
        drop(stats);

        match message.channel.as_str() {
            channels::EPISODIC => {
                self.cache
                    .invalidate(&format!("{}{}", keys::EPISODIC_PREFIX, event.id));
            }
            channels::SEMANTIC => {
                self.cache
                    .invalidate(&format!("{}{}", keys::SEMANTIC_PREFIX, event.id));
            }
            channels::SKILL => {
                self.cache
                    .invalidate(&format!("{}{}", keys::SKILL_PREFIX, event.id));
                // Name aliases may have moved; drop them all.
                self.cache.invalidate_prefix(keys::SKILL_NAME_PREFIX);
            }
            other => debug!(channel = other, "event on unhandled channel"),
        }
        debug!(
            channel = %message.channel,
            id = %event.id,
            "invalidated cache from peer event"
        );
    }
}
