//! Individual agent actions recorded inside a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::record::{SCHEMA_VERSION, default_schema_version};

/// A single tool invocation within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name
    pub name: String,
    /// Arguments as structured JSON
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Create a tool call.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// One agent action with its observation. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// On-disk schema revision
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    /// Unique step identifier
    pub step_id: Uuid,
    /// Session this step belongs to
    pub session_id: Uuid,
    /// When the action was taken
    pub timestamp: DateTime<Utc>,
    /// What the agent did
    pub action: String,
    /// What the agent observed afterwards
    pub observation: String,
    /// Optional reasoning trace
    pub reasoning: Option<String>,
    /// Ordered tool invocations made during this step
    pub tool_calls: Vec<ToolCall>,
    /// Whether the action succeeded
    pub success: bool,
    /// Caller-assigned importance in [0, 1]
    pub importance: f64,
}

impl Step {
    /// Create a step with a fresh id, stamped with the given time.
    #[must_use]
    pub fn new(
        session_id: Uuid,
        action: impl Into<String>,
        observation: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            step_id: Uuid::new_v4(),
            session_id,
            timestamp,
            action: action.into(),
            observation: observation.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            success: true,
            importance: 0.5,
        }
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.action.trim().is_empty() {
            return Err(Error::Validation("step action must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.importance) {
            return Err(Error::Validation(format!(
                "step importance {} outside [0, 1]",
                self.importance
            )));
        }
        Ok(())
    }
}
