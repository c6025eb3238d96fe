//! Episodes: persisted records of one task execution, with scoring.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ScoreWeights;
use crate::error::{Error, Result};
use crate::record::step::Step;
use crate::record::{SCHEMA_VERSION, default_schema_version};

/// Complete record of one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// On-disk schema revision
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    /// Unique memory identifier
    pub memory_id: Uuid,
    /// Session the task ran in
    pub session_id: Uuid,
    /// The task the agent was asked to perform
    pub task_prompt: String,
    /// Final outcome description
    pub outcome: String,
    /// Whether the task succeeded
    pub success: bool,
    /// Wall-clock duration of the attempt
    pub duration_seconds: f64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Free-form tags
    pub tags: BTreeSet<String>,
    /// Caller-assigned importance in [0, 1]
    pub importance: f64,
    /// Steps taken during the attempt, in execution order
    pub steps: Vec<Step>,
    /// Derived retrieval score; recomputed on scoring passes
    pub score: f64,
    /// Set once the consolidator has folded this episode into a pattern
    #[serde(default)]
    pub consolidated: bool,
    /// Number of semantic patterns derived from this episode
    #[serde(default)]
    pub derived_pattern_count: u32,
}

impl Episode {
    /// Create an unscored episode.
    #[must_use]
    pub fn new(
        session_id: Uuid,
        task_prompt: impl Into<String>,
        outcome: impl Into<String>,
        success: bool,
        duration_seconds: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            memory_id: Uuid::new_v4(),
            session_id,
            task_prompt: task_prompt.into(),
            outcome: outcome.into(),
            success,
            duration_seconds,
            created_at,
            tags: BTreeSet::new(),
            importance: 0.5,
            steps: Vec::new(),
            score: 0.0,
            consolidated: false,
            derived_pattern_count: 0,
        }
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.task_prompt.trim().is_empty() {
            return Err(Error::Validation(
                "episode task_prompt must not be empty".into(),
            ));
        }
        if self.duration_seconds < 0.0 {
            return Err(Error::Validation(format!(
                "episode duration_seconds {} is negative",
                self.duration_seconds
            )));
        }
        if !(0.0..=1.0).contains(&self.importance) {
            return Err(Error::Validation(format!(
                "episode importance {} outside [0, 1]",
                self.importance
            )));
        }
        for step in &self.steps {
            step.validate()?;
        }
        Ok(())
    }

    /// Recency term of the scoring function: `exp(-age / tau)`, clamped to [0, 1].
    #[must_use]
    pub fn recency(&self, now: DateTime<Utc>, tau: std::time::Duration) -> f64 {
        let age = now
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let tau_secs = tau.as_secs_f64().max(f64::EPSILON);
        (-age.as_secs_f64() / tau_secs).exp().clamp(0.0, 1.0)
    }

    /// Utility term: saturating growth with the number of derived patterns.
    #[must_use]
    pub fn utility(&self) -> f64 {
        1.0 - (-0.5 * f64::from(self.derived_pattern_count)).exp()
    }

    /// Recompute the retrieval score.
    ///
    /// Successful episodes never score below `min_success_score`.
    pub fn rescore(
        &mut self,
        weights: ScoreWeights,
        tau: std::time::Duration,
        min_success_score: f64,
        now: DateTime<Utc>,
    ) {
        let success_term = if self.success { 1.0 } else { 0.0 };
        let mut score = weights.w_success * success_term
            + weights.w_importance * self.importance
            + weights.w_recency * self.recency(now, tau)
            + weights.w_utility * self.utility();
        if self.success {
            score = score.max(min_success_score);
        }
        self.score = score.clamp(0.0, 1.0);
    }

    /// Searchable text used by the retrieval index.
    #[must_use]
    pub fn index_text(&self) -> String {
        let mut text = format!("{} {}", self.task_prompt, self.outcome);
        for tag in &self.tags {
            text.push(' ');
            text.push_str(tag);
        }
        for step in &self.steps {
            text.push(' ');
            text.push_str(&step.action);
        }
        text
    }
}

/// Filter for episodic queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeFilter {
    /// Restrict to one session
    pub session_id: Option<Uuid>,
    /// Substring match against the task prompt
    pub task_prompt_contains: Option<String>,
    /// Minimum derived score
    pub min_score: Option<f64>,
    /// Inclusive creation-time range
    pub created_between: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Required tags (all must be present)
    pub tags: BTreeSet<String>,
    /// Restrict to not-yet-consolidated episodes
    pub unconsolidated_only: bool,
}

impl EpisodeFilter {
    /// Check whether an episode satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, episode: &Episode) -> bool {
        if let Some(session_id) = self.session_id {
            if episode.session_id != session_id {
                return false;
            }
        }
        if let Some(ref needle) = self.task_prompt_contains {
            if !episode
                .task_prompt
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(min_score) = self.min_score {
            if episode.score < min_score {
                return false;
            }
        }
        if let Some((from, to)) = self.created_between {
            if episode.created_at < from || episode.created_at > to {
                return false;
            }
        }
        if !self.tags.is_subset(&episode.tags) {
            return false;
        }
        if self.unconsolidated_only && episode.consolidated {
            return false;
        }
        true
    }
}

/// Partial update applied to a stored episode.
///
/// `memory_id`, `created_at`, and `session_id` are immutable and therefore
/// absent here by construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeUpdate {
    /// Replace the outcome text
    pub outcome: Option<String>,
    /// Replace the success flag
    pub success: Option<bool>,
    /// Replace the importance
    pub importance: Option<f64>,
    /// Replace the tag set
    pub tags: Option<BTreeSet<String>>,
    /// Replace the consolidated flag
    pub consolidated: Option<bool>,
    /// Replace the derived pattern counter
    pub derived_pattern_count: Option<u32>,
}

impl EpisodeUpdate {
    /// Check whether the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to an episode in place.
    pub fn apply(&self, episode: &mut Episode) {
        if let Some(ref outcome) = self.outcome {
            episode.outcome.clone_from(outcome);
        }
        if let Some(success) = self.success {
            episode.success = success;
        }
        if let Some(importance) = self.importance {
            episode.importance = importance;
        }
        if let Some(ref tags) = self.tags {
            episode.tags.clone_from(tags);
        }
        if let Some(consolidated) = self.consolidated {
            episode.consolidated = consolidated;
        }
        if let Some(count) = self.derived_pattern_count {
            episode.derived_pattern_count = count;
        }
    }
}
