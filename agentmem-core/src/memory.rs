//! Runtime wiring and the per-agent memory facade.
//!
//! [`MemoryRuntime`] is the explicit composition root: one value owns the
//! lock manager, backend adapter, stores, skill library, and background
//! workers. Nothing here is a process global; tests build a fresh runtime
//! per case and resource names collide exactly when two components share a
//! runtime.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{
    BackendAdapter, DurableStore, InMemoryDurableStore, MemoryTier, SharedKv, TieredDurableStore,
    keys,
};
use crate::clock::{Clock as _, SharedClock, SystemClock};
use crate::config::MemoryConfig;
use crate::consolidation::{ConsolidationOutcome, Consolidator};
use crate::error::Result;
use crate::lock::LockManager;
use crate::record::{Episode, EpisodeFilter, SemanticPattern, Skill, Step};
use crate::retrieval::{InMemoryIndex, RetrievalIndex};
use crate::session::{SessionRecord, SessionRegistry};
use crate::skills::{ScriptedExecutor, SkillExecutor, SkillHistoryLog, SkillLibrary};
use crate::store::{EpisodicStore, SemanticStore, SkillStore};

// Cadence of the idle-session sweep.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Fields a caller provides when finalizing a task into an episode.
#[derive(Debug, Clone, Default)]
pub struct EpisodeDraft {
    /// The task the agent was asked to perform
    pub task_prompt: String,
    /// Final outcome description
    pub outcome: String,
    /// Whether the task succeeded
    pub success: bool,
    /// Wall-clock duration of the attempt
    pub duration_seconds: f64,
    /// Free-form tags
    pub tags: BTreeSet<String>,
    /// Caller-assigned importance in [0, 1]
    pub importance: f64,
}

/// Structured context assembled from every memory tier.
#[derive(Debug, Clone, Default)]
pub struct EnrichedContext {
    /// Most recent working-memory steps
    pub recent_steps: Vec<Step>,
    /// Relevant episodes
    pub episodes: Vec<Episode>,
    /// Relevant semantic patterns
    pub patterns: Vec<SemanticPattern>,
    /// Relevant active skills
    pub skills: Vec<Skill>,
    /// Rolling success rate over the working buffer
    pub working_success_rate: f64,
    /// Mean importance over the working buffer
    pub working_mean_importance: f64,
}

/// Builder for [`MemoryRuntime`].
pub struct MemoryRuntimeBuilder {
    config: MemoryConfig,
    data_dir: PathBuf,
    durable: Option<Arc<dyn DurableStore>>,
    shared: Option<Arc<dyn SharedKv>>,
    index: Option<Arc<dyn RetrievalIndex>>,
    executor: Option<Arc<dyn SkillExecutor>>,
    clock: Option<SharedClock>,
}

impl MemoryRuntimeBuilder {
    /// Start from defaults: in-memory durable store, no shared KV,
    /// in-memory index, system clock, data under `./memory`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: MemoryConfig::default(),
            data_dir: PathBuf::from("memory"),
            durable: None,
            shared: None,
            index: None,
            executor: None,
            clock: None,
        }
    }

    /// Override the configuration.
    #[must_use]
    pub fn config(mut self, config: MemoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Directory for lock files and skill history logs.
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// One durable store for every tier.
    #[must_use]
    pub fn durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Separate durable stores per tier (`episodic.db`, `semantic.db`,
    /// `skill.db` deployments).
    #[must_use]
    pub fn durable_tiers(
        mut self,
        episodic: Arc<dyn DurableStore>,
        semantic: Arc<dyn DurableStore>,
        skill: Arc<dyn DurableStore>,
    ) -> Self {
        self.durable = Some(Arc::new(TieredDurableStore::new(episodic, semantic, skill)));
        self
    }

    /// Optional shared KV + bus.
    #[must_use]
    pub fn shared_kv(mut self, shared: Arc<dyn SharedKv>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Override the retrieval index.
    #[must_use]
    pub fn index(mut self, index: Arc<dyn RetrievalIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Skill executor supplied by the host application.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn SkillExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Override the clock (tests install a manual clock).
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and wire everything together.
    pub fn build(self) -> Result<Arc<MemoryRuntime>> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let durable = self
            .durable
            .unwrap_or_else(|| Arc::new(InMemoryDurableStore::new()));
        let index = self
            .index
            .unwrap_or_else(|| Arc::new(InMemoryIndex::new()));
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ScriptedExecutor::new()));

        let locks = LockManager::new(&self.data_dir.join("locks"), self.config.locks);
        let adapter = BackendAdapter::new(durable, self.shared, &self.config, clock.clone());
        let sessions = Arc::new(SessionRegistry::new(
            self.config.working_capacity,
            clock.clone(),
        ));

        let episodic = Arc::new(EpisodicStore::new(
            Arc::clone(&locks),
            Arc::clone(&adapter),
            Arc::clone(&index),
            clock.clone(),
            self.config.clone(),
        ));
        let semantic = Arc::new(SemanticStore::new(
            Arc::clone(&locks),
            Arc::clone(&adapter),
            Arc::clone(&index),
            clock.clone(),
            self.config.clone(),
        ));
        let skills = Arc::new(SkillStore::new(
            Arc::clone(&locks),
            Arc::clone(&adapter),
            Arc::clone(&index),
            clock.clone(),
            self.config.clone(),
        ));
        let history = SkillHistoryLog::new(self.data_dir.join("skills_history"), Arc::clone(&locks));
        let library = SkillLibrary::new(
            Arc::clone(&skills),
            history,
            executor,
            clock.clone(),
            self.config.clone(),
        );
        let consolidator = Consolidator::new(
            Arc::clone(&episodic),
            Arc::clone(&semantic),
            clock.clone(),
            self.config.clone(),
        );

        Ok(Arc::new(MemoryRuntime {
            config: self.config,
            clock,
            locks,
            adapter,
            sessions,
            episodic,
            semantic,
            skills,
            library,
            consolidator,
            background: Mutex::new(Vec::new()),
        }))
    }
}

impl Default for MemoryRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Composition root owning every subsystem and the background workers.
pub struct MemoryRuntime {
    config: MemoryConfig,
    clock: SharedClock,
    locks: Arc<LockManager>,
    adapter: Arc<BackendAdapter>,
    sessions: Arc<SessionRegistry>,
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticStore>,
    skills: Arc<SkillStore>,
    library: Arc<SkillLibrary>,
    consolidator: Arc<Consolidator>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryRuntime {
    /// Start building a runtime.
    #[must_use]
    pub fn builder() -> MemoryRuntimeBuilder {
        MemoryRuntimeBuilder::new()
    }

    /// Configuration the runtime was built with.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Clock shared by every component.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// The lock registry (stats, status, long-wait detection).
    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The backend adapter (health, stats, cache metrics).
    #[must_use]
    pub fn adapter(&self) -> &Arc<BackendAdapter> {
        &self.adapter
    }

    /// Episodic store.
    #[must_use]
    pub fn episodic(&self) -> &Arc<EpisodicStore> {
        &self.episodic
    }

    /// Semantic store.
    #[must_use]
    pub fn semantic(&self) -> &Arc<SemanticStore> {
        &self.semantic
    }

    /// Skill store (low-level; prefer [`MemoryRuntime::skill_library`]).
    #[must_use]
    pub fn skill_store(&self) -> &Arc<SkillStore> {
        &self.skills
    }

    /// Skill library facade.
    #[must_use]
    pub fn skill_library(&self) -> &Arc<SkillLibrary> {
        &self.library
    }

    /// Session registry.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Consolidator (call `run_once` directly or start the periodic worker).
    #[must_use]
    pub fn consolidator(&self) -> &Arc<Consolidator> {
        &self.consolidator
    }

    /// Per-agent facade.
    #[must_use]
    pub fn agent(&self, agent_id: impl Into<String>) -> AgentMemory {
        AgentMemory {
            sessions: Arc::clone(&self.sessions),
            episodic: Arc::clone(&self.episodic),
            semantic: Arc::clone(&self.semantic),
            library: Arc::clone(&self.library),
            adapter: Arc::clone(&self.adapter),
            clock: self.clock.clone(),
            working_capacity: self.config.working_capacity,
            agent_id: agent_id.into(),
        }
    }

    /// Spawn the background workers: bus listener, health probe, periodic
    /// consolidation, and idle-session sweeping.
    pub fn start_background(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            debug!("background workers already running");
            return;
        }
        background.push(Arc::clone(&self.adapter).start_event_listener());
        background.push(Arc::clone(&self.adapter).start_health_probe());
        background.push(Arc::clone(&self.consolidator).start());

        let sessions = Arc::clone(&self.sessions);
        let idle_ttl = self.config.session_idle_ttl;
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let expired = sessions.expire_idle(idle_ttl);
                if !expired.is_empty() {
                    debug!(count = expired.len(), "expired idle sessions");
                }
            }
        }));
        info!("background workers started");
    }

    /// Stop every background worker.
    pub fn shutdown(&self) {
        let mut background = self.background.lock();
        for handle in background.drain(..) {
            handle.abort();
        }
        info!("background workers stopped");
    }

    /// Run one consolidation pass now.
    pub async fn consolidate_now(&self) -> Result<ConsolidationOutcome> {
        self.consolidator.run_once().await
    }
}

impl Drop for MemoryRuntime {
    fn drop(&mut self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Per-agent view over the runtime: sessions, episodes, patterns, and
/// enriched context assembly.
pub struct AgentMemory {
    sessions: Arc<SessionRegistry>,
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticStore>,
    library: Arc<SkillLibrary>,
    adapter: Arc<BackendAdapter>,
    clock: SharedClock,
    working_capacity: usize,
    agent_id: String,
}

impl AgentMemory {
    /// Owning agent id.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Open a fresh session for this agent.
    #[must_use]
    pub fn create_session(&self) -> Uuid {
        self.sessions.create(&self.agent_id)
    }

    /// Append a step to a session's working memory.
    ///
    /// The step and the session record are also mirrored best-effort into
    /// the shared KV under the working and session tiers, so peers can
    /// observe live activity; the step buffer itself never leaves the
    /// process.
    pub async fn add_step(&self, session_id: Uuid, step: Step) -> Result<()> {
        self.sessions.add_step(session_id, step.clone())?;

        self.adapter
            .mirror_record(
                &keys::working(&self.agent_id, step.step_id),
                MemoryTier::Working,
                &step,
            )
            .await;
        if let Ok(session) = self.sessions.get(session_id) {
            self.adapter
                .mirror_record(
                    &keys::session(session_id),
                    MemoryTier::Session,
                    &SessionRecord::from(&session),
                )
                .await;
        }
        Ok(())
    }

    /// The last `k` steps of a session.
    pub fn context(&self, session_id: Uuid, k: usize) -> Result<Vec<Step>> {
        self.sessions.context(session_id, k)
    }

    /// Finalize a task: build an episode from the session's buffered steps
    /// and persist it through the episodic store.
    pub async fn save_episode(&self, session_id: Uuid, draft: EpisodeDraft) -> Result<Episode> {
        let steps = self.sessions.context(session_id, self.working_capacity)?;

        let mut episode = Episode::new(
            session_id,
            draft.task_prompt,
            draft.outcome,
            draft.success,
            draft.duration_seconds,
            self.clock.now(),
        );
        episode.tags = draft.tags;
        episode.importance = draft.importance;
        episode.steps = steps;
        self.episodic.add(episode).await
    }

    /// Fetch one episode.
    pub async fn get_episode(&self, memory_id: Uuid) -> Result<Episode> {
        self.episodic.get(memory_id).await
    }

    /// Filtered episodic query.
    pub async fn query_episodes(
        &self,
        filter: &EpisodeFilter,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        self.episodic.query(filter, limit).await
    }

    /// Episodic similarity search.
    pub async fn search_episodes(&self, text: &str, limit: usize) -> Result<Vec<Episode>> {
        self.episodic.search(text, limit).await
    }

    /// Persist a semantic pattern.
    pub async fn save_pattern(&self, pattern: SemanticPattern) -> Result<SemanticPattern> {
        self.semantic.add(pattern).await
    }

    /// Reinforce a semantic pattern.
    pub async fn reinforce_pattern(
        &self,
        memory_id: Uuid,
        delta_support: u32,
        supporting_episodes: &[Uuid],
    ) -> Result<SemanticPattern> {
        self.semantic
            .reinforce(memory_id, delta_support, supporting_episodes)
            .await
    }

    /// Semantic similarity search.
    pub async fn search_patterns(&self, text: &str, limit: usize) -> Result<Vec<SemanticPattern>> {
        self.semantic.search(text, limit).await
    }

    /// Assemble structured context from every tier for a query.
    ///
    /// `k` bounds the recent steps, `per_type_limit` bounds each retrieved
    /// tier. With a null index the retrieved tiers come back empty and the
    /// working-memory portion still works.
    pub async fn enriched_context(
        &self,
        session_id: Uuid,
        query: &str,
        k: usize,
        per_type_limit: usize,
    ) -> Result<EnrichedContext> {
        let session = self.sessions.get(session_id)?;
        let recent_steps = session.working.recent(k);

        let episodes = self.episodic.search(query, per_type_limit).await?;
        let patterns = self.semantic.search(query, per_type_limit).await?;
        let skills = self
            .library
            .search_skills(query, None, per_type_limit)
            .await?;

        Ok(EnrichedContext {
            recent_steps,
            episodes,
            patterns,
            skills,
            working_success_rate: session.working.success_rate(),
            working_mean_importance: session.working.mean_importance(),
        })
    }

    /// Close a session, discarding its working memory.
    pub fn close_session(&self, session_id: Uuid) -> Result<()> {
        self.sessions.close(session_id).map(|_| ())
    }
}
