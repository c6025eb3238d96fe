//! End-to-end episodic flow for a single agent: session, steps, episode,
//! query, search, and enriched context.

use std::sync::Arc;

use agentmem_core::memory::{EpisodeDraft, MemoryRuntime};
use agentmem_core::record::EpisodeFilter;
use agentmem_core::{Error, InMemorySharedKv, ManualClock, SharedKv};
use tempfile::TempDir;
use test_utils::{create_failed_step, create_test_step};

fn runtime(dir: &TempDir) -> Arc<MemoryRuntime> {
    MemoryRuntime::builder()
        .data_dir(dir.path())
        .build()
        .expect("runtime builds")
}

fn extract_title_draft() -> EpisodeDraft {
    EpisodeDraft {
        task_prompt: "Extract title".to_string(),
        outcome: "ok".to_string(),
        success: true,
        duration_seconds: 2.5,
        importance: 0.8,
        ..EpisodeDraft::default()
    }
}

#[tokio::test]
async fn single_agent_episodic_round_trip() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(&dir);
    let agent = runtime.agent("agent-1");

    let session = agent.create_session();
    for action in [
        "navigate https://example.com",
        "extract title",
        "save result.csv",
    ] {
        agent
            .add_step(session, create_test_step(session, action))
            .await
            .unwrap();
    }

    let episode = agent
        .save_episode(session, extract_title_draft())
        .await
        .unwrap();

    // get returns the fields that went in.
    let fetched = agent.get_episode(episode.memory_id).await.unwrap();
    assert_eq!(fetched.task_prompt, "Extract title");
    assert_eq!(fetched.outcome, "ok");
    assert!(fetched.success);
    assert!((fetched.duration_seconds - 2.5).abs() < f64::EPSILON);
    assert!((fetched.importance - 0.8).abs() < f64::EPSILON);
    assert_eq!(fetched.steps.len(), 3);
    assert_eq!(fetched.session_id, session);

    // query by session returns exactly this episode.
    let filter = EpisodeFilter {
        session_id: Some(session),
        ..EpisodeFilter::default()
    };
    let queried = agent.query_episodes(&filter, 10).await.unwrap();
    assert_eq!(queried.len(), 1);
    assert_eq!(queried[0].memory_id, episode.memory_id);

    // search puts it in first position.
    let found = agent.search_episodes("title", 5).await.unwrap();
    assert!(!found.is_empty());
    assert_eq!(found[0].memory_id, episode.memory_id);
}

#[tokio::test]
async fn working_memory_capacity_keeps_most_recent() {
    let dir = TempDir::new().unwrap();
    let config = agentmem_core::MemoryConfig {
        working_capacity: 5,
        ..agentmem_core::MemoryConfig::default()
    };
    let runtime = MemoryRuntime::builder()
        .data_dir(dir.path())
        .config(config)
        .build()
        .unwrap();
    let agent = runtime.agent("agent-1");
    let session = agent.create_session();

    for i in 0..8 {
        agent
            .add_step(session, create_test_step(session, &format!("step-{i}")))
            .await
            .unwrap();
    }

    let context = agent.context(session, 10).unwrap();
    assert_eq!(context.len(), 5);
    let actions: Vec<&str> = context.iter().map(|s| s.action.as_str()).collect();
    assert_eq!(actions, vec!["step-3", "step-4", "step-5", "step-6", "step-7"]);
}

#[tokio::test]
async fn enriched_context_combines_all_tiers() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(&dir);
    let agent = runtime.agent("agent-1");

    let session = agent.create_session();
    agent
        .add_step(session, create_test_step(session, "open login page"))
        .await
        .unwrap();
    agent
        .add_step(session, create_failed_step(session, "submit login form"))
        .await
        .unwrap();

    agent
        .save_episode(
            session,
            EpisodeDraft {
                task_prompt: "Login to example.com".to_string(),
                outcome: "logged in".to_string(),
                success: true,
                duration_seconds: 4.0,
                importance: 0.7,
                ..EpisodeDraft::default()
            },
        )
        .await
        .unwrap();
    agent
        .save_pattern(test_utils::create_test_pattern("retry login after captcha", 3))
        .await
        .unwrap();
    runtime
        .skill_library()
        .add_skill(test_utils::create_login_skill(), true, None)
        .await
        .unwrap();

    let context = agent.enriched_context(session, "login", 10, 5).await.unwrap();
    assert_eq!(context.recent_steps.len(), 2);
    assert!(!context.episodes.is_empty());
    assert!(!context.patterns.is_empty());
    assert!(!context.skills.is_empty());
    assert!((context.working_success_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn null_index_degrades_search_gracefully() {
    let dir = TempDir::new().unwrap();
    let runtime = MemoryRuntime::builder()
        .data_dir(dir.path())
        .index(Arc::new(agentmem_core::NullIndex))
        .build()
        .unwrap();
    let agent = runtime.agent("agent-1");
    let session = agent.create_session();
    agent
        .add_step(session, create_test_step(session, "navigate"))
        .await
        .unwrap();

    let episode = agent
        .save_episode(session, extract_title_draft())
        .await
        .unwrap();

    // Direct get and query still work; search comes back empty, not broken.
    assert!(agent.get_episode(episode.memory_id).await.is_ok());
    assert!(agent.search_episodes("title", 5).await.unwrap().is_empty());
    let context = agent.enriched_context(session, "title", 5, 5).await.unwrap();
    assert_eq!(context.recent_steps.len(), 1);
    assert!(context.episodes.is_empty());
}

#[tokio::test]
async fn invalidated_cache_still_serves_from_durable() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::shared();
    let shared = Arc::new(InMemorySharedKv::new(clock.clone()));
    let runtime = MemoryRuntime::builder()
        .data_dir(dir.path())
        .clock(clock)
        .shared_kv(Arc::clone(&shared) as Arc<dyn SharedKv>)
        .build()
        .unwrap();
    let agent = runtime.agent("agent-1");
    let session = agent.create_session();

    let episode = agent
        .save_episode(session, extract_title_draft())
        .await
        .unwrap();

    // Drop the fast layers; the durable store still answers.
    let key = format!("memory:episodic:{}", episode.memory_id);
    runtime.adapter().invalidate_local(&key);
    shared.del(&key).await.unwrap();

    let fetched = agent.get_episode(episode.memory_id).await.unwrap();
    assert_eq!(fetched.memory_id, episode.memory_id);
}

#[tokio::test]
async fn steps_mirror_into_working_and_session_tiers() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::shared();
    let shared = Arc::new(InMemorySharedKv::new(clock.clone()));
    let runtime = MemoryRuntime::builder()
        .data_dir(dir.path())
        .clock(clock)
        .shared_kv(Arc::clone(&shared) as Arc<dyn SharedKv>)
        .build()
        .unwrap();
    let agent = runtime.agent("agent-1");
    let session = agent.create_session();

    let step = create_test_step(session, "navigate");
    let step_id = step.step_id;
    agent.add_step(session, step).await.unwrap();

    // The step and the session record are visible to peers under their
    // tier keys; the durable store never sees them.
    let working_key = format!("agent:agent-1:working:{step_id}");
    let session_key = format!("session:{session}");
    assert!(shared.get(&working_key).await.unwrap().is_some());
    assert!(shared.get(&session_key).await.unwrap().is_some());
}

#[tokio::test]
async fn update_rejects_bad_importance() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(&dir);
    let agent = runtime.agent("agent-1");
    let session = agent.create_session();
    let episode = agent
        .save_episode(session, extract_title_draft())
        .await
        .unwrap();

    let err = runtime
        .episodic()
        .update(
            episode.memory_id,
            &agentmem_core::EpisodeUpdate {
                importance: Some(1.7),
                ..agentmem_core::EpisodeUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
