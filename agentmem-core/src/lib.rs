#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::module_name_repetitions)]

//! # Agentmem Core
//!
//! Concurrent memory and skill substrate for multi-agent automation.
//!
//! Many agents concurrently read, write, retrieve, cache, version, and
//! share memories against pluggable local or distributed backends, with
//! bounded-staleness caches, optimistic concurrency, TTL eviction, and
//! cross-process publish/subscribe invalidation.
//!
//! ## Subsystems
//!
//! - [`lock`]: fair RW locks, cross-process file locks, and the per-runtime
//!   lock registry with statistics and long-wait detection
//! - [`record`] + [`session`]: the data model: steps, episodes, semantic
//!   patterns, skills, and bounded per-session working memory
//! - [`store`]: episodic, semantic, and skill stores over the locking and
//!   backend substrate
//! - [`skills`]: the skill library facade with versioning, optimistic
//!   locking, batched execution, and composition
//! - [`backend`]: dual-write adapter over a durable store and an optional
//!   shared KV + bus, with health fallback and peer cache invalidation
//! - [`consolidation`]: the periodic worker promoting recurring episodes
//!   into semantic patterns
//! - [`memory`]: the runtime composition root and per-agent facade
//!
//! ## Quick start
//!
//! ```no_run
//! use agentmem_core::memory::{EpisodeDraft, MemoryRuntime};
//! use agentmem_core::record::Step;
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() -> agentmem_core::Result<()> {
//!     let runtime = MemoryRuntime::builder()
//!         .data_dir("./memory")
//!         .build()?;
//!     runtime.start_background();
//!
//!     let agent = runtime.agent("agent-1");
//!     let session = agent.create_session();
//!     agent
//!         .add_step(
//!             session,
//!             Step::new(session, "navigate https://example.com", "page loaded", Utc::now()),
//!         )
//!         .await?;
//!
//!     let episode = agent
//!         .save_episode(
//!             session,
//!             EpisodeDraft {
//!                 task_prompt: "Extract title".to_string(),
//!                 outcome: "ok".to_string(),
//!                 success: true,
//!                 duration_seconds: 2.5,
//!                 importance: 0.8,
//!                 ..EpisodeDraft::default()
//!             },
//!         )
//!         .await?;
//!
//!     let similar = agent.search_episodes("title", 5).await?;
//!     println!("{} similar episodes, latest {}", similar.len(), episode.memory_id);
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod lock;
pub mod memory;
pub mod record;
pub mod retrieval;
pub mod session;
pub mod skills;
pub mod store;

// Re-export commonly used types
pub use backend::{
    AdapterStats, BackendAdapter, BackendHealth, DurableStore, FaultMode, InMemoryDurableStore,
    InMemorySharedKv, MemoryTier, NullSharedKv, SharedKv, TieredDurableStore,
};
pub use cache::{BoundedTtlCache, CacheMetrics};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use codec::PayloadCodec;
pub use config::{MemoryConfig, ScoreWeights};
pub use consolidation::{ConsolidationOutcome, Consolidator};
pub use error::{Error, Result};
pub use lock::{LockKind, LockManager, platform_supports_true_cross_process_lock};
pub use memory::{AgentMemory, EnrichedContext, EpisodeDraft, MemoryRuntime, MemoryRuntimeBuilder};
pub use record::{
    ActionStep, Episode, EpisodeFilter, EpisodeUpdate, ParameterSpec, ParameterType, PatternFilter,
    PatternKind, SemanticPattern, Skill, SkillCategory, SkillFilter, SkillStats, SkillStatus,
    SkillVersion, Step, ToolCall,
};
pub use retrieval::{InMemoryIndex, NullIndex, RetrievalIndex, SearchHit};
pub use session::{SessionRecord, SessionRegistry, WorkingMemory};
pub use skills::{
    ComposedStep, ComposedStepStatus, CompositionReport, ExecutionContext, ExecutionReport,
    ScriptedExecutor, ScriptedOutcome, SkillError, SkillExecutor, SkillLibrary,
};
pub use store::{EpisodicStore, SemanticStore, SkillStore};
