//! Storage providers and the dual-write backend adapter.
//!
//! The substrate persists through two pluggable shapes: a local durable
//! store (embedded, crash-safe, deterministic scans) and an optional shared
//! KV that also carries a publish/subscribe bus for cross-process cache
//! invalidation. The adapter composes them; the core runs unchanged with a
//! null shared KV.

mod adapter;
mod memory;
mod tiered;

pub use adapter::{AdapterStats, BackendAdapter, BackendHealth};
pub use memory::{FaultMode, InMemoryDurableStore, InMemorySharedKv, NullSharedKv};
pub use tiered::TieredDurableStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or replace a key
    Put {
        /// Target key
        key: String,
        /// Framed payload bytes
        value: Vec<u8>,
    },
    /// Remove a key
    Delete {
        /// Target key
        key: String,
    },
}

/// Local durable key-value store.
///
/// Must survive process restarts. `scan` returns entries in ascending
/// lexicographic byte order of keys so result ordering is deterministic.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read one key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace one key.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove one key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Entries whose keys start with `prefix`, ascending by key, at most
    /// `limit` of them.
    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply every operation atomically: either all land or none do.
    async fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<()>;
}

/// Message delivered by a bus subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message arrived on
    pub channel: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

/// Active subscription feeding bus messages into a channel receiver.
pub struct BusSubscription {
    /// Message stream; closed when the backing connection drops.
    pub receiver: tokio::sync::mpsc::Receiver<BusMessage>,
}

/// Optional shared key-value store with per-key TTLs and a pub/sub bus.
#[async_trait]
pub trait SharedKv: Send + Sync {
    /// Read one key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write one key with a TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Remove one key.
    async fn del(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to the given channels.
    async fn subscribe(&self, channels: &[&str]) -> Result<BusSubscription>;

    /// Connection health probe.
    async fn ping(&self) -> Result<()>;
}

/// Memory tier a key belongs to; selects its shared-KV TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    /// Per-agent working steps
    Working,
    /// Episodic records
    Episodic,
    /// Semantic patterns
    Semantic,
    /// Skills and skill-name aliases
    Skill,
    /// Session records
    Session,
}

impl MemoryTier {
    /// TTL for this tier under the given configuration.
    #[must_use]
    pub fn ttl(self, ttls: &crate::config::TierTtls) -> Duration {
        match self {
            MemoryTier::Working => ttls.working,
            MemoryTier::Episodic => ttls.episodic,
            MemoryTier::Semantic => ttls.semantic,
            MemoryTier::Skill => ttls.skill,
            MemoryTier::Session => ttls.session,
        }
    }
}

/// Key namespaces shared by the adapter, both stores, and peers.
pub mod keys {
    use uuid::Uuid;

    /// Prefix of episodic record keys.
    pub const EPISODIC_PREFIX: &str = "memory:episodic:";
    /// Prefix of semantic record keys.
    pub const SEMANTIC_PREFIX: &str = "memory:semantic:";
    /// Prefix of skill record keys.
    pub const SKILL_PREFIX: &str = "memory:skill:";
    /// Prefix of skill-by-name alias keys.
    pub const SKILL_NAME_PREFIX: &str = "skill:name:";
    /// Prefix of session record keys.
    pub const SESSION_PREFIX: &str = "session:";
    /// Prefix of quarantined undecodable entries.
    pub const QUARANTINE_PREFIX: &str = "quarantine:";

    /// Key of an episodic record.
    #[must_use]
    pub fn episodic(memory_id: Uuid) -> String {
        format!("{EPISODIC_PREFIX}{memory_id}")
    }

    /// Key of a semantic record.
    #[must_use]
    pub fn semantic(memory_id: Uuid) -> String {
        format!("{SEMANTIC_PREFIX}{memory_id}")
    }

    /// Key of a skill record.
    #[must_use]
    pub fn skill(skill_id: Uuid) -> String {
        format!("{SKILL_PREFIX}{skill_id}")
    }

    /// Alias key mapping an active skill name to its id.
    #[must_use]
    pub fn skill_by_name(name: &str) -> String {
        format!("{SKILL_NAME_PREFIX}{name}")
    }

    /// Key of one working-memory step mirror.
    #[must_use]
    pub fn working(agent_id: &str, step_id: Uuid) -> String {
        format!("agent:{agent_id}:working:{step_id}")
    }

    /// Key of a session record.
    #[must_use]
    pub fn session(session_id: Uuid) -> String {
        format!("{SESSION_PREFIX}{session_id}")
    }
}

/// Pub/sub channels connecting adapter instances.
pub mod channels {
    /// Episodic change notifications.
    pub const EPISODIC: &str = "agent:memory:episodic";
    /// Semantic change notifications.
    pub const SEMANTIC: &str = "agent:memory:semantic";
    /// Skill change notifications.
    pub const SKILL: &str = "agent:memory:skill";

    /// All channels an adapter subscribes to.
    pub const ALL: [&str; 3] = [EPISODIC, SEMANTIC, SKILL];
}

/// What happened to an entity, as carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    /// Entity was created
    Added,
    /// Entity was modified
    Updated,
    /// Entity was removed
    Deleted,
}

/// Change notification published after each committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// What happened
    pub op: EventOp,
    /// Affected entity id
    pub id: String,
    /// Adapter instance that performed the write; receivers drop their own
    pub source_instance: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespaces_are_disjoint() {
        let id = Uuid::new_v4();
        assert!(keys::episodic(id).starts_with(keys::EPISODIC_PREFIX));
        assert!(keys::semantic(id).starts_with(keys::SEMANTIC_PREFIX));
        assert!(keys::skill(id).starts_with(keys::SKILL_PREFIX));
        assert!(!keys::skill(id).starts_with(keys::SKILL_NAME_PREFIX));
        assert!(keys::skill_by_name("login").starts_with(keys::SKILL_NAME_PREFIX));
    }

    #[test]
    fn test_event_round_trips_as_json() {
        let event = MemoryEvent {
            op: EventOp::Added,
            id: Uuid::new_v4().to_string(),
            source_instance: Uuid::new_v4(),
        };
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: MemoryEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_tier_ttls_follow_config() {
        let ttls = crate::config::TierTtls::default();
        assert_eq!(MemoryTier::Working.ttl(&ttls), Duration::from_secs(3600));
        assert_eq!(
            MemoryTier::Skill.ttl(&ttls),
            Duration::from_secs(180 * 24 * 3600)
        );
    }
}
