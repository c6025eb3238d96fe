//! Routes the unified keyspace onto per-tier durable stores.
//!
//! Deployments keep episodic, semantic, and skill data in separate durable
//! files (`episodic.db`, `semantic.db`, `skill.db`); this router dispatches
//! each key to its tier's store by prefix so the adapter sees one keyspace.

use async_trait::async_trait;
use std::sync::Arc;

use super::{BatchOp, DurableStore, keys};
use crate::error::Result;

/// Prefix router over three durable stores.
pub struct TieredDurableStore {
    episodic: Arc<dyn DurableStore>,
    semantic: Arc<dyn DurableStore>,
    skill: Arc<dyn DurableStore>,
}

impl TieredDurableStore {
    /// Compose the router from per-tier stores.
    #[must_use]
    pub fn new(
        episodic: Arc<dyn DurableStore>,
        semantic: Arc<dyn DurableStore>,
        skill: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            episodic,
            semantic,
            skill,
        }
    }

    fn route(&self, key: &str) -> &Arc<dyn DurableStore> {
        // Quarantined entries stay in the tier their original key lives in.
        let effective = key.strip_prefix(keys::QUARANTINE_PREFIX).unwrap_or(key);
        if effective.starts_with(keys::SEMANTIC_PREFIX) {
            &self.semantic
        } else if effective.starts_with(keys::SKILL_PREFIX)
            || effective.starts_with(keys::SKILL_NAME_PREFIX)
        {
            &self.skill
        } else {
            // Episodic data plus working/session mirrors.
            &self.episodic
        }
    }
}

#[async_trait]
impl DurableStore for TieredDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.route(key).get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.route(key).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.route(key).delete(key).await
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        self.route(prefix).scan(prefix, limit).await
    }

    async fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<()> {
        // Batches are grouped per tier; atomicity holds within each tier,
        // which is all the substrate relies on.
        let mut episodic = Vec::new();
        let mut semantic = Vec::new();
        let mut skill = Vec::new();
        for op in batch {
            let key = match &op {
                BatchOp::Put { key, .. } | BatchOp::Delete { key } => key.as_str(),
            };
            let target = self.route(key);
            if Arc::ptr_eq(target, &self.semantic) {
                semantic.push(op);
            } else if Arc::ptr_eq(target, &self.skill) {
                skill.push(op);
            } else {
                episodic.push(op);
            }
        }
        if !episodic.is_empty() {
            self.episodic.apply_batch(episodic).await?;
        }
        if !semantic.is_empty() {
            self.semantic.apply_batch(semantic).await?;
        }
        if !skill.is_empty() {
            self.skill.apply_batch(skill).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryDurableStore;
    use uuid::Uuid;

    fn router() -> (
        TieredDurableStore,
        Arc<InMemoryDurableStore>,
        Arc<InMemoryDurableStore>,
        Arc<InMemoryDurableStore>,
    ) {
        let episodic = Arc::new(InMemoryDurableStore::new());
        let semantic = Arc::new(InMemoryDurableStore::new());
        let skill = Arc::new(InMemoryDurableStore::new());
        let tiered = TieredDurableStore::new(
            Arc::clone(&episodic) as Arc<dyn DurableStore>,
            Arc::clone(&semantic) as Arc<dyn DurableStore>,
            Arc::clone(&skill) as Arc<dyn DurableStore>,
        );
        (tiered, episodic, semantic, skill)
    }

    #[tokio::test]
    async fn test_keys_land_in_their_tier() {
        let (tiered, episodic, semantic, skill) = router();
        let id = Uuid::new_v4();

        tiered.put(&keys::episodic(id), b"e").await.unwrap();
        tiered.put(&keys::semantic(id), b"p").await.unwrap();
        tiered.put(&keys::skill(id), b"s").await.unwrap();
        tiered.put(&keys::skill_by_name("login"), b"a").await.unwrap();

        assert_eq!(episodic.len(), 1);
        assert_eq!(semantic.len(), 1);
        assert_eq!(skill.len(), 2);
    }

    #[tokio::test]
    async fn test_quarantine_stays_in_original_tier() {
        let (tiered, _episodic, semantic, _skill) = router();
        let id = Uuid::new_v4();
        let quarantined = format!("{}{}", keys::QUARANTINE_PREFIX, keys::semantic(id));
        tiered.put(&quarantined, b"bad").await.unwrap();
        assert_eq!(semantic.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_routes_by_prefix() {
        let (tiered, _episodic, _semantic, _skill) = router();
        let id = Uuid::new_v4();
        tiered.put(&keys::skill(id), b"s").await.unwrap();

        let hits = tiered.scan(keys::SKILL_PREFIX, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(tiered.scan(keys::SEMANTIC_PREFIX, 10).await.unwrap().is_empty());
    }
}
