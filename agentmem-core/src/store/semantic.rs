//! Persistent knowledge patterns distilled from episodes.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::{SCAN_ALL, SEMANTIC_RESOURCE, check_limit};
use crate::backend::{BackendAdapter, EventOp, MemoryTier, channels, keys};
use crate::clock::{Clock as _, SharedClock};
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::record::{PatternFilter, SemanticPattern};
use crate::retrieval::{IndexFilter, RetrievalIndex};

fn index_metadata() -> IndexFilter {
    let mut metadata = IndexFilter::new();
    metadata.insert("tier".to_string(), "semantic".to_string());
    metadata
}

/// Store of semantic patterns with reinforcement and decay.
pub struct SemanticStore {
    locks: Arc<LockManager>,
    adapter: Arc<BackendAdapter>,
    index: Arc<dyn RetrievalIndex>,
    clock: SharedClock,
    config: MemoryConfig,
}

impl SemanticStore {
    /// Create a store over the shared substrate.
    #[must_use]
    pub fn new(
        locks: Arc<LockManager>,
        adapter: Arc<BackendAdapter>,
        index: Arc<dyn RetrievalIndex>,
        clock: SharedClock,
        config: MemoryConfig,
    ) -> Self {
        Self {
            locks,
            adapter,
            index,
            clock,
            config,
        }
    }

    /// Persist a pattern; index update is best-effort.
    pub async fn add(&self, pattern: SemanticPattern) -> Result<SemanticPattern> {
        pattern.validate()?;

        let key = keys::semantic(pattern.memory_id);
        {
            let _guard = self.locks.write_lock(SEMANTIC_RESOURCE).await?;
            self.adapter
                .put_record(&key, MemoryTier::Semantic, &pattern)
                .await?;
        }

        if let Err(e) = self
            .index
            .add(
                &pattern.memory_id.to_string(),
                &pattern.index_text(),
                index_metadata(),
            )
            .await
        {
            warn!(memory_id = %pattern.memory_id, error = %e, "semantic index update failed");
        }
        self.adapter
            .publish_event(channels::SEMANTIC, EventOp::Added, &pattern.memory_id.to_string())
            .await;

        info!(
            memory_id = %pattern.memory_id,
            kind = ?pattern.kind,
            support = pattern.support_count,
            "semantic pattern added"
        );
        Ok(pattern)
    }

    /// Fetch one pattern.
    pub async fn get(&self, memory_id: Uuid) -> Result<SemanticPattern> {
        let _guard = self.locks.read_lock(SEMANTIC_RESOURCE).await?;
        self.adapter
            .get_record(&keys::semantic(memory_id), MemoryTier::Semantic)
            .await?
            .ok_or(Error::NotFound(memory_id))
    }

    /// Filtered query ordered by confidence descending, stable on id.
    pub async fn query(&self, filter: &PatternFilter, limit: usize) -> Result<Vec<SemanticPattern>> {
        check_limit(limit, self.config.max_query_limit)?;

        let mut patterns: Vec<SemanticPattern> = {
            let _guard = self.locks.read_lock(SEMANTIC_RESOURCE).await?;
            self.adapter
                .scan_records(keys::SEMANTIC_PREFIX, SCAN_ALL)
                .await?
                .into_iter()
                .map(|(_, pattern)| pattern)
                .filter(|pattern| filter.matches(pattern))
                .collect()
        };

        patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        patterns.truncate(limit);
        Ok(patterns)
    }

    /// Similarity search, ranked by `confidence * similarity` descending
    /// with a stable tie-break on id.
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<SemanticPattern>> {
        check_limit(limit, self.config.max_query_limit)?;
        let hits = self
            .index
            .search(text, Some(&index_metadata()), self.config.max_query_limit)
            .await?;

        let mut ranked = Vec::with_capacity(hits.len());
        {
            let _guard = self.locks.read_lock(SEMANTIC_RESOURCE).await?;
            for hit in hits {
                let Ok(memory_id) = Uuid::parse_str(&hit.id) else {
                    continue;
                };
                if let Some(pattern) = self
                    .adapter
                    .get_record::<SemanticPattern>(&keys::semantic(memory_id), MemoryTier::Semantic)
                    .await?
                {
                    ranked.push((pattern.confidence * hit.similarity, pattern));
                }
            }
        }

        ranked.sort_by(|(wa, a), (wb, b)| {
            wb.partial_cmp(wa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        ranked.truncate(limit);
        Ok(ranked.into_iter().map(|(_, pattern)| pattern).collect())
    }

    /// Reinforce a pattern with additional supporting observations.
    ///
    /// Also records the episodes that contributed, so a later identical
    /// consolidation pass does not double-count them.
    pub async fn reinforce(
        &self,
        memory_id: Uuid,
        delta_support: u32,
        supporting_episodes: &[Uuid],
    ) -> Result<SemanticPattern> {
        let key = keys::semantic(memory_id);
        let pattern = {
            let _guard = self.locks.write_lock(SEMANTIC_RESOURCE).await?;
            let mut pattern: SemanticPattern = self
                .adapter
                .get_record(&key, MemoryTier::Semantic)
                .await?
                .ok_or(Error::NotFound(memory_id))?;
            pattern.reinforce(delta_support, self.config.confidence_alpha, self.clock.now());
            for episode_id in supporting_episodes {
                pattern.derived_from.insert(*episode_id);
            }
            self.adapter
                .put_record(&key, MemoryTier::Semantic, &pattern)
                .await?;
            pattern
        };

        self.adapter
            .publish_event(channels::SEMANTIC, EventOp::Updated, &memory_id.to_string())
            .await;
        Ok(pattern)
    }

    /// Decay the confidence of patterns not reinforced within the window.
    ///
    /// Returns how many patterns were decayed.
    pub async fn decay_stale(&self) -> Result<usize> {
        let now = self.clock.now();
        let window = self.config.consolidation.decay_window;
        let factor = self.config.consolidation.decay_factor;

        let stale: Vec<SemanticPattern> = {
            let _guard = self.locks.read_lock(SEMANTIC_RESOURCE).await?;
            self.adapter
                .scan_records::<SemanticPattern>(keys::SEMANTIC_PREFIX, SCAN_ALL)
                .await?
                .into_iter()
                .map(|(_, pattern)| pattern)
                .filter(|pattern| {
                    now.signed_duration_since(pattern.updated_at)
                        .to_std()
                        .is_ok_and(|idle| idle > window)
                })
                .collect()
        };

        let decayed = stale.len();
        for mut pattern in stale {
            let key = keys::semantic(pattern.memory_id);
            let _guard = self.locks.write_lock(SEMANTIC_RESOURCE).await?;
            pattern.decay(factor, now);
            self.adapter
                .put_record(&key, MemoryTier::Semantic, &pattern)
                .await?;
        }
        Ok(decayed)
    }
}
