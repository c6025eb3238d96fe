//! Skill execution provider.
//!
//! The substrate stores and schedules skills; actually performing their
//! action sequences (driving a browser, calling tools) belongs to the host
//! application behind [`SkillExecutor`]. [`ScriptedExecutor`] is the test
//! implementation: per-skill scripted outcomes, delays, and failures.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::record::Skill;

/// Failure declared by a skill execution.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SkillError {
    /// Human-readable failure description
    pub message: String,
    /// Whether a composition may skip this step and continue
    pub recoverable: bool,
}

impl SkillError {
    /// A failure compositions may skip over.
    #[must_use]
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    /// A failure that stops a composition.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

/// Shared mutable execution context passed through skills.
pub type ExecutionContext = serde_json::Map<String, serde_json::Value>;

/// Runs a skill's action sequence against the host environment.
///
/// Implementations may read and mutate the context; the library threads the
/// same context through composed skills in order.
#[async_trait]
pub trait SkillExecutor: Send + Sync {
    /// Execute the skill, returning its output value.
    async fn execute(
        &self,
        skill: &Skill,
        context: &mut ExecutionContext,
    ) -> std::result::Result<serde_json::Value, SkillError>;
}

/// Scripted outcome for one skill under the [`ScriptedExecutor`].
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Succeed with the given output
    Succeed(serde_json::Value),
    /// Fail with a declared error
    Fail {
        /// Failure description
        message: String,
        /// Whether compositions may skip past it
        recoverable: bool,
    },
    /// Sleep, then succeed; used to trigger execution deadlines
    Delay(Duration),
}

/// Test executor with per-skill-name scripted outcomes.
///
/// Every execution appends the skill name to the `executed` array in the
/// shared context so composition tests can observe ordering and data flow.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<HashMap<String, ScriptedOutcome>>,
}

impl ScriptedExecutor {
    /// Create an executor where every skill succeeds with `null`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome for a skill name.
    pub fn script(&self, skill_name: impl Into<String>, outcome: ScriptedOutcome) {
        self.outcomes.lock().insert(skill_name.into(), outcome);
    }
}

#[async_trait]
impl SkillExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        skill: &Skill,
        context: &mut ExecutionContext,
    ) -> std::result::Result<serde_json::Value, SkillError> {
        let outcome = self.outcomes.lock().get(&skill.name).cloned();
        let result = match outcome {
            None => serde_json::Value::Null,
            Some(ScriptedOutcome::Succeed(value)) => value,
            Some(ScriptedOutcome::Fail {
                message,
                recoverable,
            }) => {
                return Err(SkillError {
                    message,
                    recoverable,
                });
            }
            Some(ScriptedOutcome::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                serde_json::Value::Null
            }
        };

        let executed = context
            .entry("executed".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let serde_json::Value::Array(names) = executed {
            names.push(serde_json::Value::String(skill.name.clone()));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ActionStep, SkillCategory};
    use chrono::Utc;

    fn skill(name: &str) -> Skill {
        Skill::new(
            name,
            "test",
            SkillCategory::Utility,
            vec![ActionStep::new("only", "noop")],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_default_outcome_succeeds_and_traces() {
        let executor = ScriptedExecutor::new();
        let mut context = ExecutionContext::new();
        let output = executor.execute(&skill("a"), &mut context).await.unwrap();
        assert_eq!(output, serde_json::Value::Null);
        assert_eq!(context["executed"], serde_json::json!(["a"]));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_returned() {
        let executor = ScriptedExecutor::new();
        executor.script(
            "broken",
            ScriptedOutcome::Fail {
                message: "declared failure".to_string(),
                recoverable: true,
            },
        );
        let mut context = ExecutionContext::new();
        let err = executor
            .execute(&skill("broken"), &mut context)
            .await
            .unwrap_err();
        assert!(err.recoverable);
        assert!(context.get("executed").is_none());
    }
}
