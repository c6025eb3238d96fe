//! # Test Utilities
//!
//! Shared fixtures for the agentmem workspace: step, episode, pattern, and
//! skill generators used across unit and integration tests.

use std::collections::BTreeSet;

use agentmem_core::record::{
    ActionStep, Episode, ParameterSpec, ParameterType, SemanticPattern, PatternKind, Skill,
    SkillCategory, SkillStatus, Step, ToolCall,
};
use chrono::Utc;
use uuid::Uuid;

/// Create a step with the given action and a matching observation.
pub fn create_test_step(session_id: Uuid, action: &str) -> Step {
    let mut step = Step::new(session_id, action, format!("{action}: ok"), Utc::now());
    step.tool_calls.push(ToolCall::new(
        "browser",
        serde_json::json!({ "action": action }),
    ));
    step.importance = 0.5;
    step
}

/// Create a failed step.
pub fn create_failed_step(session_id: Uuid, action: &str) -> Step {
    let mut step = create_test_step(session_id, action);
    step.success = false;
    step.observation = format!("{action}: failed");
    step
}

/// Create an episode with the given prompt and success flag.
pub fn create_test_episode(task_prompt: &str, success: bool) -> Episode {
    let session_id = Uuid::new_v4();
    let mut episode = Episode::new(
        session_id,
        task_prompt,
        if success { "ok" } else { "failed" },
        success,
        2.5,
        Utc::now(),
    );
    episode.importance = 0.6;
    for action in ["navigate", "extract", "save"] {
        episode.steps.push(create_test_step(session_id, action));
    }
    episode
}

/// Create a tagged episode with a specific outcome text.
pub fn create_tagged_episode(task_prompt: &str, outcome: &str, tags: &[&str]) -> Episode {
    let mut episode = create_test_episode(task_prompt, true);
    episode.outcome = outcome.to_string();
    episode.tags = tags.iter().map(|t| (*t).to_string()).collect();
    episode
}

/// Create a procedure pattern supported by `support` fresh episode ids.
pub fn create_test_pattern(content: &str, support: usize) -> SemanticPattern {
    let derived: BTreeSet<Uuid> = (0..support).map(|_| Uuid::new_v4()).collect();
    SemanticPattern::new(PatternKind::Procedure, content, derived, 0.3, Utc::now())
}

/// Create a draft skill with three action steps and no parameters.
pub fn create_test_skill(name: &str) -> Skill {
    Skill::new(
        name,
        format!("{name} flow"),
        SkillCategory::Utility,
        vec![
            ActionStep::new("open", "navigate to target"),
            ActionStep::new("act", "perform the action"),
            ActionStep::new("verify", "confirm the result"),
        ],
        Utc::now(),
    )
}

/// Create an active skill ready for retrieval and execution.
pub fn create_active_skill(name: &str) -> Skill {
    let mut skill = create_test_skill(name);
    skill.status = SkillStatus::Active;
    skill
}

/// Create an active login skill with required credential parameters.
pub fn create_login_skill() -> Skill {
    let mut skill = Skill::new(
        "login_generic",
        "Generic username/password login",
        SkillCategory::Authentication,
        vec![
            ActionStep::new("open", "navigate to login page"),
            ActionStep::new("fill", "fill credentials"),
            ActionStep::new("submit", "submit form"),
        ],
        Utc::now(),
    );
    skill.parameters = vec![
        ParameterSpec::required("username", ParameterType::String),
        ParameterSpec::required("password", ParameterType::String),
    ];
    skill.status = SkillStatus::Active;
    skill
}
