//! Persistent skill records with lifecycle, stats, and name uniqueness.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SCAN_ALL, SKILL_RESOURCE, check_limit};
use crate::backend::{BackendAdapter, EventOp, MemoryTier, channels, keys};
use crate::clock::{Clock as _, SharedClock};
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::record::{Skill, SkillFilter, SkillStats, SkillStatus};
use crate::retrieval::{IndexFilter, RetrievalIndex};

fn index_metadata() -> IndexFilter {
    let mut metadata = IndexFilter::new();
    metadata.insert("tier".to_string(), "skill".to_string());
    metadata
}

/// Store of skills keyed by id, with a name alias for the active revision.
pub struct SkillStore {
    locks: Arc<LockManager>,
    adapter: Arc<BackendAdapter>,
    index: Arc<dyn RetrievalIndex>,
    clock: SharedClock,
    config: MemoryConfig,
}

impl SkillStore {
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

    /// Insert or replace a skill record.
    ///
    /// Enforces the `(name, status = active)` uniqueness invariant inside the
    /// write lock: committing an active skill whose name belongs to a
    /// different active skill fails with [`Error::NameConflict`].
    pub async fn insert(&self, skill: Skill) -> Result<Skill> {
        let (skill, _prior) = self.upsert_versioned(skill, None, false).await?;
        Ok(skill)
    }

    /// Insert a skill with optimistic version control, atomically.
    ///
    /// Under one write lock: when `expected_version` is given, the stored
    /// version must equal it or the call fails with
    /// [`Error::VersionConflict`]. When `bump_version` is set and a prior
    /// revision exists, the committed skill gets `prior.version + 1`.
    /// Returns the committed skill and the superseded revision, if any.
    pub async fn upsert_versioned(
        &self,
        mut skill: Skill,
        expected_version: Option<u32>,
        bump_version: bool,
    ) -> Result<(Skill, Option<Skill>)> {
        skill.validate()?;

        let key = keys::skill(skill.skill_id);
        let prior = {
            let _guard = self.locks.write_lock(SKILL_RESOURCE).await?;

            let prior: Option<Skill> = self.adapter.get_record(&key, MemoryTier::Skill).await?;
            if let Some(expected) = expected_version {
                let actual = prior.as_ref().map_or(0, |p| p.version);
                if actual != expected {
                    return Err(Error::VersionConflict { expected, actual });
                }
            }
            if bump_version {
                if let Some(ref prior) = prior {
                    skill.version = prior.version + 1;
                }
            }
            skill.validate()?;

            if skill.status == SkillStatus::Active {
                if let Some(holder) = self.active_name_holder(&skill.name).await? {
                    if holder != skill.skill_id {
                        return Err(Error::NameConflict(skill.name.clone()));
                    }
                }
            }

            // A renamed revision leaves its old alias behind; drop it.
            if let Some(ref prior) = prior {
                if prior.name != skill.name {
                    self.remove_alias_if_owned(&prior.name, skill.skill_id)
                        .await?;
                }
            }

            self.adapter
                .put_record(&key, MemoryTier::Skill, &skill)
                .await?;
            match skill.status {
                SkillStatus::Active => {
                    self.adapter
                        .put_record(
                            &keys::skill_by_name(&skill.name),
                            MemoryTier::Skill,
                            &skill.skill_id.to_string(),
                        )
                        .await?;
                }
                SkillStatus::Draft | SkillStatus::Deprecated => {
                    self.remove_alias_if_owned(&skill.name, skill.skill_id)
                        .await?;
                }
            }
            prior
        };

        self.sync_index(&skill).await;
        self.adapter
            .publish_event(channels::SKILL, EventOp::Updated, &skill.skill_id.to_string())
            .await;
        Ok((skill, prior))
    }

    // An alias is only ever removed by the skill it points to; a draft that
    // happens to share a name with another active skill must not unmap it.
    async fn remove_alias_if_owned(&self, name: &str, skill_id: Uuid) -> Result<()> {
        let alias_holder = self
            .adapter
            .get_record::<String>(&keys::skill_by_name(name), MemoryTier::Skill)
            .await?
            .and_then(|id| Uuid::parse_str(&id).ok());
        if alias_holder == Some(skill_id) {
            self.adapter
                .delete_record(&keys::skill_by_name(name))
                .await?;
        }
        Ok(())
    }

    async fn active_name_holder(&self, name: &str) -> Result<Option<Uuid>> {
        let Some(holder_id) = self
            .adapter
            .get_record::<String>(&keys::skill_by_name(name), MemoryTier::Skill)
            .await?
        else {
            return Ok(None);
        };
        let Ok(holder_id) = Uuid::parse_str(&holder_id) else {
            return Ok(None);
        };
        // Defensive: the alias might outlive a deprecation that crashed
        // mid-write. Only a live active skill holds the name.
        let holder: Option<Skill> = self
            .adapter
            .get_record(&keys::skill(holder_id), MemoryTier::Skill)
            .await?;
        Ok(holder
            .filter(|s| s.status == SkillStatus::Active && s.name == name)
            .map(|s| s.skill_id))
    }

    async fn sync_index(&self, skill: &Skill) {
        let id = skill.skill_id.to_string();
        let result = if skill.status == SkillStatus::Active {
            self.index
                .add(&id, &skill.index_text(), index_metadata())
                .await
        } else {
            self.index.remove(&id).await
        };
        if let Err(e) = result {
            warn!(skill_id = %skill.skill_id, error = %e, "skill index update failed");
        }
    }

    /// Fetch one skill by id, regardless of status.
    pub async fn get(&self, skill_id: Uuid) -> Result<Skill> {
        let _guard = self.locks.read_lock(SKILL_RESOURCE).await?;
        self.adapter
            .get_record(&keys::skill(skill_id), MemoryTier::Skill)
            .await?
            .ok_or(Error::NotFound(skill_id))
    }

    /// Fetch the single active skill with the given name.
    pub async fn get_by_name(&self, name: &str) -> Result<Skill> {
        let _guard = self.locks.read_lock(SKILL_RESOURCE).await?;
        let holder_id = self
            .adapter
            .get_record::<String>(&keys::skill_by_name(name), MemoryTier::Skill)
            .await?
            .and_then(|id| Uuid::parse_str(&id).ok())
            .ok_or_else(|| Error::NotFoundByName(name.to_string()))?;
        let skill: Skill = self
            .adapter
            .get_record(&keys::skill(holder_id), MemoryTier::Skill)
            .await?
            .ok_or_else(|| Error::NotFoundByName(name.to_string()))?;
        if skill.status != SkillStatus::Active || skill.name != name {
            return Err(Error::NotFoundByName(name.to_string()));
        }
        Ok(skill)
    }

    /// Filtered query ordered by success rate, usage, then id.
    pub async fn query(&self, filter: &SkillFilter, limit: usize) -> Result<Vec<Skill>> {
        check_limit(limit, self.config.max_query_limit)?;

        let mut skills: Vec<Skill> = {
            let _guard = self.locks.read_lock(SKILL_RESOURCE).await?;
            self.adapter
                .scan_records(keys::SKILL_PREFIX, SCAN_ALL)
                .await?
                .into_iter()
                .map(|(_, skill)| skill)
                .filter(|skill| filter.matches(skill))
                .collect()
        };

        skills.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.usage_count.cmp(&a.usage_count))
                .then_with(|| a.skill_id.cmp(&b.skill_id))
        });
        skills.truncate(limit);
        Ok(skills)
    }

    /// Similarity search over active skills.
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<Skill>> {
        check_limit(limit, self.config.max_query_limit)?;
        let hits = self
            .index
            .search(text, Some(&index_metadata()), limit)
            .await?;

        let _guard = self.locks.read_lock(SKILL_RESOURCE).await?;
        let mut skills = Vec::with_capacity(hits.len());
        for hit in hits {
            let Ok(skill_id) = Uuid::parse_str(&hit.id) else {
                continue;
            };
            match self
                .adapter
                .get_record::<Skill>(&keys::skill(skill_id), MemoryTier::Skill)
                .await
            {
                Ok(Some(skill)) if skill.status == SkillStatus::Active => skills.push(skill),
                Ok(_) => debug!(skill_id = %skill_id, "indexed skill not active"),
                Err(e) => warn!(skill_id = %skill_id, error = %e, "failed to load indexed skill"),
            }
        }
        Ok(skills)
    }

    /// Fold one execution into a skill's statistics under the write lock.
    pub async fn record_execution(
        &self,
        skill_id: Uuid,
        success: bool,
        duration: std::time::Duration,
    ) -> Result<SkillStats> {
        let key = keys::skill(skill_id);
        let stats = {
            let _guard = self.locks.write_lock(SKILL_RESOURCE).await?;
            let mut skill: Skill = self
                .adapter
                .get_record(&key, MemoryTier::Skill)
                .await?
                .ok_or(Error::NotFound(skill_id))?;
            skill.record_execution(success, duration, self.config.duration_ewma_beta);
            skill.updated_at = self.clock.now();
            self.adapter
                .put_record(&key, MemoryTier::Skill, &skill)
                .await?;
            SkillStats::from(&skill)
        };

        self.adapter
            .publish_event(channels::SKILL, EventOp::Updated, &skill_id.to_string())
            .await;
        debug!(
            skill_id = %skill_id,
            success,
            usage_count = stats.usage_count,
            "recorded skill execution"
        );
        Ok(stats)
    }

    /// Transition a skill to deprecated. Applying it twice is a no-op.
    ///
    /// When `replacement_id` is given it must name an active skill.
    pub async fn deprecate(&self, skill_id: Uuid, replacement_id: Option<Uuid>) -> Result<Skill> {
        let key = keys::skill(skill_id);
        let skill = {
            let _guard = self.locks.write_lock(SKILL_RESOURCE).await?;
            let mut skill: Skill = self
                .adapter
                .get_record(&key, MemoryTier::Skill)
                .await?
                .ok_or(Error::NotFound(skill_id))?;

            if skill.status == SkillStatus::Deprecated {
                return Ok(skill);
            }

            if let Some(replacement_id) = replacement_id {
                let replacement: Skill = self
                    .adapter
                    .get_record(&keys::skill(replacement_id), MemoryTier::Skill)
                    .await?
                    .ok_or(Error::NotFound(replacement_id))?;
                if replacement.status != SkillStatus::Active {
                    return Err(Error::Validation(format!(
                        "replacement skill {replacement_id} is not active"
                    )));
                }
            }

            skill.status = SkillStatus::Deprecated;
            skill.updated_at = self.clock.now();
            self.remove_alias_if_owned(&skill.name, skill.skill_id)
                .await?;
            self.adapter
                .put_record(&key, MemoryTier::Skill, &skill)
                .await?;
            skill
        };

        self.sync_index(&skill).await;
        self.adapter
            .publish_event(channels::SKILL, EventOp::Updated, &skill_id.to_string())
            .await;
        info!(skill_id = %skill_id, "skill deprecated");
        Ok(skill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DurableStore, InMemoryDurableStore};
    use crate::clock::ManualClock;
    use crate::config::LockConfig;
    use crate::record::{ActionStep, SkillCategory};
    use crate::retrieval::InMemoryIndex;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SkillStore {
        let clock = ManualClock::shared();
        let config = MemoryConfig::default();
        let adapter = BackendAdapter::new(
            Arc::new(InMemoryDurableStore::new()) as Arc<dyn DurableStore>,
            None,
            &config,
            clock.clone(),
        );
        SkillStore::new(
            LockManager::new(dir.path(), LockConfig::default()),
            adapter,
            Arc::new(InMemoryIndex::new()),
            clock,
            config,
        )
    }

    fn active_skill(name: &str) -> Skill {
        let mut skill = Skill::new(
            name,
            "a reusable flow",
            SkillCategory::Authentication,
            vec![ActionStep::new("step", "do the thing")],
            Utc::now(),
        );
        skill.status = SkillStatus::Active;
        skill
    }

    #[tokio::test]
    async fn test_insert_then_get_by_name() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let skill = store.insert(active_skill("login_generic")).await.unwrap();

        let by_name = store.get_by_name("login_generic").await.unwrap();
        assert_eq!(by_name.skill_id, skill.skill_id);
        assert_eq!(store.get(skill.skill_id).await.unwrap(), by_name);
    }

    #[tokio::test]
    async fn test_name_conflict_between_active_skills() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.insert(active_skill("login_generic")).await.unwrap();

        let err = store.insert(active_skill("login_generic")).await.unwrap_err();
        assert!(matches!(err, Error::NameConflict(name) if name == "login_generic"));
    }

    #[tokio::test]
    async fn test_draft_with_shared_name_leaves_active_alias_alone() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let active = store.insert(active_skill("login_generic")).await.unwrap();

        let mut draft = active_skill("login_generic");
        draft.status = SkillStatus::Draft;
        store.insert(draft).await.unwrap();

        // The active skill still owns its name.
        let by_name = store.get_by_name("login_generic").await.unwrap();
        assert_eq!(by_name.skill_id, active.skill_id);
    }

    #[tokio::test]
    async fn test_deprecated_name_is_reusable() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let old = store.insert(active_skill("login_generic")).await.unwrap();
        store.deprecate(old.skill_id, None).await.unwrap();

        assert!(store.insert(active_skill("login_generic")).await.is_ok());
    }

    #[tokio::test]
    async fn test_deprecate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let skill = store.insert(active_skill("login_generic")).await.unwrap();

        let first = store.deprecate(skill.skill_id, None).await.unwrap();
        let second = store.deprecate(skill.skill_id, None).await.unwrap();
        assert_eq!(first, second);
        assert!(store.get_by_name("login_generic").await.is_err());
    }

    #[tokio::test]
    async fn test_deprecate_validates_replacement() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let skill = store.insert(active_skill("login_v1")).await.unwrap();
        let draft = {
            let mut s = active_skill("login_v2");
            s.status = SkillStatus::Draft;
            store.insert(s).await.unwrap()
        };

        let err = store
            .deprecate(skill.skill_id, Some(draft.skill_id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let replacement = store.insert(active_skill("login_v3")).await.unwrap();
        assert!(
            store
                .deprecate(skill.skill_id, Some(replacement.skill_id))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_record_execution_updates_stats() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let skill = store.insert(active_skill("login_generic")).await.unwrap();

        let stats = store
            .record_execution(skill.skill_id, true, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(stats.usage_count, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);

        let stats = store
            .record_execution(skill.skill_id, false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stats.usage_count, 2);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_search_excludes_deprecated() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let skill = store.insert(active_skill("login_generic")).await.unwrap();
        assert!(!store.search("reusable flow", 5).await.unwrap().is_empty());

        store.deprecate(skill.skill_id, None).await.unwrap();
        assert!(store.search("reusable flow", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_drops_stale_alias() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut skill = store.insert(active_skill("old_name")).await.unwrap();

        skill.name = "new_name".to_string();
        skill.version += 1;
        store.insert(skill).await.unwrap();

        assert!(store.get_by_name("old_name").await.is_err());
        assert!(store.get_by_name("new_name").await.is_ok());
    }

    #[tokio::test]
    async fn test_query_orders_by_success_rate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let poor = store.insert(active_skill("poor")).await.unwrap();
        let good = store.insert(active_skill("good")).await.unwrap();

        store
            .record_execution(poor.skill_id, false, Duration::from_secs(1))
            .await
            .unwrap();
        store
            .record_execution(good.skill_id, true, Duration::from_secs(1))
            .await
            .unwrap();

        let results = store.query(&SkillFilter::active(), 10).await.unwrap();
        assert_eq!(results[0].skill_id, good.skill_id);
    }
}
