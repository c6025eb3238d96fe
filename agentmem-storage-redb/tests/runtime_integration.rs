//! The redb store plugged into a full runtime: per-tier files, episodic
//! round trip, and persistence across a runtime restart.

use std::path::Path;
use std::sync::Arc;

use agentmem_core::DurableStore;
use agentmem_core::memory::MemoryRuntime;
use agentmem_storage_redb::RedbStore;
use tempfile::TempDir;
use test_utils::{create_active_skill, create_tagged_episode};

async fn runtime_at(data_dir: &Path) -> Arc<MemoryRuntime> {
    let episodic = RedbStore::open(&data_dir.join("episodic.db")).await.unwrap();
    let semantic = RedbStore::open(&data_dir.join("semantic.db")).await.unwrap();
    let skill = RedbStore::open(&data_dir.join("skill.db")).await.unwrap();

    MemoryRuntime::builder()
        .data_dir(data_dir)
        .durable_tiers(
            Arc::new(episodic) as Arc<dyn DurableStore>,
            Arc::new(semantic) as Arc<dyn DurableStore>,
            Arc::new(skill) as Arc<dyn DurableStore>,
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn episodic_round_trip_through_redb() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime_at(dir.path()).await;

    let episode = runtime
        .episodic()
        .add(create_tagged_episode(
            "Extract title",
            "ok",
            &["extraction"],
        ))
        .await
        .unwrap();

    let fetched = runtime.episodic().get(episode.memory_id).await.unwrap();
    assert_eq!(fetched, episode);

    // Tier files exist where the deployment layout expects them.
    assert!(dir.path().join("episodic.db").exists());
    assert!(dir.path().join("semantic.db").exists());
    assert!(dir.path().join("skill.db").exists());
}

#[tokio::test]
async fn memories_survive_runtime_restart() {
    let dir = TempDir::new().unwrap();

    let (episode_id, skill_id) = {
        let runtime = runtime_at(dir.path()).await;
        let episode = runtime
            .episodic()
            .add(create_tagged_episode("persisted task", "done", &["login"]))
            .await
            .unwrap();
        let skill = runtime
            .skill_library()
            .add_skill(create_active_skill("persisted_skill"), true, None)
            .await
            .unwrap();
        (episode.memory_id, skill.skill_id)
    };

    // A fresh runtime over the same files sees everything.
    let runtime = runtime_at(dir.path()).await;
    let episode = runtime.episodic().get(episode_id).await.unwrap();
    assert_eq!(episode.task_prompt, "persisted task");

    let skill = runtime.skill_store().get(skill_id).await.unwrap();
    assert_eq!(skill.name, "persisted_skill");
    // The name alias persisted too.
    let by_name = runtime
        .skill_store()
        .get_by_name("persisted_skill")
        .await
        .unwrap();
    assert_eq!(by_name.skill_id, skill_id);
}

#[tokio::test]
async fn compressed_payloads_round_trip_through_redb() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime_at(dir.path()).await;

    // A large, repetitive outcome crosses the compression threshold.
    let big_outcome = "form submitted successfully; ".repeat(200);
    let episode = runtime
        .episodic()
        .add(create_tagged_episode("bulk form fill", &big_outcome, &["forms"]))
        .await
        .unwrap();

    runtime
        .adapter()
        .invalidate_local(&format!("memory:episodic:{}", episode.memory_id));
    let fetched = runtime.episodic().get(episode.memory_id).await.unwrap();
    assert_eq!(fetched.outcome, big_outcome);
}
