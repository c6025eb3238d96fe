//! Persistent, queryable log of task executions.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EPISODIC_RESOURCE, SCAN_ALL, check_limit};
use crate::backend::{BackendAdapter, EventOp, MemoryTier, channels, keys};
use crate::clock::{Clock as _, SharedClock};
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::record::{Episode, EpisodeFilter, EpisodeUpdate};
use crate::retrieval::{IndexFilter, RetrievalIndex};

fn index_metadata() -> IndexFilter {
    let mut metadata = IndexFilter::new();
    metadata.insert("tier".to_string(), "episodic".to_string());
    metadata
}

/// Store of completed task episodes, scored for retrieval.
pub struct EpisodicStore {
    locks: Arc<LockManager>,
    adapter: Arc<BackendAdapter>,
    index: Arc<dyn RetrievalIndex>,
    clock: SharedClock,
    config: MemoryConfig,
}

impl EpisodicStore {
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

    /// Persist an episode: validate, score, store, index, publish.
    ///
    /// The index update is best-effort; an index failure leaves the episode
    /// persisted and is surfaced only as a warning.
    pub async fn add(&self, mut episode: Episode) -> Result<Episode> {
        episode.validate()?;
        episode.rescore(
            self.config.score_weights,
            self.config.recency_tau,
            self.config.min_success_score,
            self.clock.now(),
        );

        let key = keys::episodic(episode.memory_id);
        {
            let _guard = self.locks.write_lock(EPISODIC_RESOURCE).await?;
            self.adapter
                .put_record(&key, MemoryTier::Episodic, &episode)
                .await?;
        }

        if let Err(e) = self
            .index
            .add(
                &episode.memory_id.to_string(),
                &episode.index_text(),
                index_metadata(),
            )
            .await
        {
            warn!(memory_id = %episode.memory_id, error = %e, "episodic index update failed");
        }

        self.adapter
            .publish_event(channels::EPISODIC, EventOp::Added, &episode.memory_id.to_string())
            .await;

        info!(memory_id = %episode.memory_id, score = episode.score, "episode added");
        Ok(episode)
    }

    /// Fetch one episode.
    pub async fn get(&self, memory_id: Uuid) -> Result<Episode> {
        let _guard = self.locks.read_lock(EPISODIC_RESOURCE).await?;
        self.adapter
            .get_record(&keys::episodic(memory_id), MemoryTier::Episodic)
            .await?
            .ok_or(Error::NotFound(memory_id))
    }

    /// Filtered query, ordered by score descending then creation time
    /// descending, with `memory_id` as the final stable tie-break.
    pub async fn query(&self, filter: &EpisodeFilter, limit: usize) -> Result<Vec<Episode>> {
        check_limit(limit, self.config.max_query_limit)?;

        let mut episodes: Vec<Episode> = {
            let _guard = self.locks.read_lock(EPISODIC_RESOURCE).await?;
            self.adapter
                .scan_records(keys::EPISODIC_PREFIX, SCAN_ALL)
                .await?
                .into_iter()
                .map(|(_, episode)| episode)
                .filter(|episode| filter.matches(episode))
                .collect()
        };

        episodes.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        episodes.truncate(limit);
        Ok(episodes)
    }

    /// Recent not-yet-consolidated episodes for the consolidator, newest
    /// first. Unlike [`EpisodicStore::query`] this is not bound by the
    /// public query limit; the consolidator batches internally.
    pub async fn sample_unconsolidated(&self, limit: usize) -> Result<Vec<Episode>> {
        let mut episodes: Vec<Episode> = {
            let _guard = self.locks.read_lock(EPISODIC_RESOURCE).await?;
            self.adapter
                .scan_records(keys::EPISODIC_PREFIX, SCAN_ALL)
                .await?
                .into_iter()
                .map(|(_, episode)| episode)
                .filter(|episode: &Episode| !episode.consolidated)
                .collect()
        };
        episodes.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        episodes.truncate(limit);
        Ok(episodes)
    }

    /// Similarity search through the retrieval index.
    ///
    /// Index failures are fatal here, unlike on the write path.
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<Episode>> {
        check_limit(limit, self.config.max_query_limit)?;
        let hits = self
            .index
            .search(text, Some(&index_metadata()), limit)
            .await?;

        let _guard = self.locks.read_lock(EPISODIC_RESOURCE).await?;
        let mut episodes = Vec::with_capacity(hits.len());
        for hit in hits {
            let Ok(memory_id) = Uuid::parse_str(&hit.id) else {
                continue;
            };
            match self
                .adapter
                .get_record::<Episode>(&keys::episodic(memory_id), MemoryTier::Episodic)
                .await
            {
                Ok(Some(episode)) => episodes.push(episode),
                Ok(None) => debug!(memory_id = %memory_id, "indexed episode no longer stored"),
                Err(e) => warn!(memory_id = %memory_id, error = %e, "failed to load indexed episode"),
            }
        }
        Ok(episodes)
    }

    /// Partial update under the write lock.
    ///
    /// Identity fields (`memory_id`, `created_at`, `session_id`) are not
    /// updatable by construction of [`EpisodeUpdate`].
    pub async fn update(&self, memory_id: Uuid, update: &EpisodeUpdate) -> Result<Episode> {
        if let Some(importance) = update.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(Error::Validation(format!(
                    "episode importance {importance} outside [0, 1]"
                )));
            }
        }

        let key = keys::episodic(memory_id);
        let episode = {
            let _guard = self.locks.write_lock(EPISODIC_RESOURCE).await?;
            let mut episode: Episode = self
                .adapter
                .get_record(&key, MemoryTier::Episodic)
                .await?
                .ok_or(Error::NotFound(memory_id))?;
            update.apply(&mut episode);
            episode.rescore(
                self.config.score_weights,
                self.config.recency_tau,
                self.config.min_success_score,
                self.clock.now(),
            );
            self.adapter
                .put_record(&key, MemoryTier::Episodic, &episode)
                .await?;
            episode
        };

        if let Err(e) = self
            .index
            .add(
                &episode.memory_id.to_string(),
                &episode.index_text(),
                index_metadata(),
            )
            .await
        {
            warn!(memory_id = %memory_id, error = %e, "episodic index update failed");
        }
        self.adapter
            .publish_event(channels::EPISODIC, EventOp::Updated, &memory_id.to_string())
            .await;
        Ok(episode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DurableStore, InMemoryDurableStore};
    use crate::clock::ManualClock;
    use crate::config::LockConfig;
    use crate::retrieval::InMemoryIndex;
    use chrono::Utc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> EpisodicStore {
        let clock = ManualClock::shared();
        let config = MemoryConfig::default();
        let adapter = BackendAdapter::new(
            Arc::new(InMemoryDurableStore::new()) as Arc<dyn DurableStore>,
            None,
            &config,
            clock.clone(),
        );
        EpisodicStore::new(
            LockManager::new(dir.path(), LockConfig::default()),
            adapter,
            Arc::new(InMemoryIndex::new()),
            clock,
            config,
        )
    }

    fn episode(task: &str, success: bool) -> Episode {
        Episode::new(Uuid::new_v4(), task, "done", success, 2.0, Utc::now())
    }

    #[tokio::test]
    async fn test_add_then_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let added = store.add(episode("Extract title", true)).await.unwrap();
        let fetched = store.get(added.memory_id).await.unwrap();
        assert_eq!(fetched, added);
        assert!(fetched.score > 0.0);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.get(missing).await,
            Err(Error::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_episode() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut bad = episode("task", true);
        bad.duration_seconds = -2.0;
        assert!(matches!(store.add(bad).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_query_orders_by_score_then_recency() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let failed = store.add(episode("task a", false)).await.unwrap();
        let succeeded = store.add(episode("task b", true)).await.unwrap();

        let results = store.query(&EpisodeFilter::default(), 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].memory_id, succeeded.memory_id);
        assert_eq!(results[1].memory_id, failed.memory_id);
    }

    #[tokio::test]
    async fn test_query_limit_bounds() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.query(&EpisodeFilter::default(), 0).await.is_err());
        assert!(store.query(&EpisodeFilter::default(), 101).await.is_err());
        assert!(store.query(&EpisodeFilter::default(), 100).await.is_ok());
    }

    #[tokio::test]
    async fn test_search_finds_relevant_episode_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let title = store.add(episode("Extract page title", true)).await.unwrap();
        store.add(episode("Download invoice pdf", true)).await.unwrap();

        let results = store.search("title", 5).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].memory_id, title.memory_id);
    }

    #[tokio::test]
    async fn test_update_preserves_identity_and_rescoring() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let added = store.add(episode("task", false)).await.unwrap();

        let updated = store
            .update(
                added.memory_id,
                &EpisodeUpdate {
                    success: Some(true),
                    outcome: Some("recovered".to_string()),
                    ..EpisodeUpdate::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.memory_id, added.memory_id);
        assert_eq!(updated.session_id, added.session_id);
        assert_eq!(updated.created_at, added.created_at);
        assert!(updated.success);
        assert!(updated.score > added.score);
    }

    #[tokio::test]
    async fn test_query_filters_by_session() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let target = store.add(episode("session scoped", true)).await.unwrap();
        store.add(episode("other", true)).await.unwrap();

        let filter = EpisodeFilter {
            session_id: Some(target.session_id),
            ..EpisodeFilter::default()
        };
        let results = store.query(&filter, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory_id, target.memory_id);
    }
}
