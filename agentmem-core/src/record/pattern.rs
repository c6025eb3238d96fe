//! Semantic patterns distilled from episodes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::record::{SCHEMA_VERSION, default_schema_version};

/// What kind of knowledge a pattern encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// A repeatable way of doing something
    Procedure,
    /// A restriction that held across episodes
    Constraint,
    /// A standalone fact about the environment
    Fact,
}

/// Generalized knowledge derived from one or more episodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticPattern {
    /// On-disk schema revision
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    /// Unique memory identifier
    pub memory_id: Uuid,
    /// Knowledge kind
    pub kind: PatternKind,
    /// The distilled content
    pub content: String,
    /// How many episodes support this pattern
    pub support_count: u32,
    /// Belief in the pattern, in [0, 1]
    pub confidence: f64,
    /// Episodes this pattern was derived from
    pub derived_from: BTreeSet<Uuid>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last reinforcement or decay timestamp
    pub updated_at: DateTime<Utc>,
}

/// Confidence law: `1 - exp(-alpha * support_count)`.
#[must_use]
pub fn confidence_for(support_count: u32, alpha: f64) -> f64 {
    (1.0 - (-alpha * f64::from(support_count)).exp()).clamp(0.0, 1.0)
}

impl SemanticPattern {
    /// Create a pattern with one supporting episode-set and derived confidence.
    #[must_use]
    pub fn new(
        kind: PatternKind,
        content: impl Into<String>,
        derived_from: BTreeSet<Uuid>,
        alpha: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let support_count = u32::try_from(derived_from.len()).unwrap_or(u32::MAX).max(1);
        Self {
            schema_version: SCHEMA_VERSION,
            memory_id: Uuid::new_v4(),
            kind,
            content: content.into(),
            support_count,
            confidence: confidence_for(support_count, alpha),
            derived_from,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(Error::Validation("pattern content must not be empty".into()));
        }
        if self.support_count == 0 {
            return Err(Error::Validation(
                "pattern support_count must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::Validation(format!(
                "pattern confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }

    /// Reinforce with `delta_support` additional supporting observations.
    ///
    /// Confidence never decreases on reinforcement, even after decay pulled
    /// it below the law's value for the new support count.
    pub fn reinforce(&mut self, delta_support: u32, alpha: f64, now: DateTime<Utc>) {
        self.support_count = self.support_count.saturating_add(delta_support);
        self.confidence = self
            .confidence
            .max(confidence_for(self.support_count, alpha));
        self.updated_at = now;
    }

    /// Multiplicative confidence decay for stale patterns.
    pub fn decay(&mut self, factor: f64, now: DateTime<Utc>) {
        self.confidence = (self.confidence * factor).clamp(0.0, 1.0);
        self.updated_at = now;
    }

    /// Searchable text used by the retrieval index.
    #[must_use]
    pub fn index_text(&self) -> String {
        self.content.clone()
    }
}

/// Filter for semantic queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternFilter {
    /// Restrict to one kind
    pub kind: Option<PatternKind>,
    /// Minimum confidence
    pub min_confidence: Option<f64>,
    /// Minimum support count
    pub min_support: Option<u32>,
    /// Require derivation from this episode
    pub derived_from: Option<Uuid>,
}

impl PatternFilter {
    /// Check whether a pattern satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, pattern: &SemanticPattern) -> bool {
        if let Some(kind) = self.kind {
            if pattern.kind != kind {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if pattern.confidence < min {
                return false;
            }
        }
        if let Some(min) = self.min_support {
            if pattern.support_count < min {
                return false;
            }
        }
        if let Some(episode_id) = self.derived_from {
            if !pattern.derived_from.contains(&episode_id) {
                return false;
            }
        }
        true
    }
}
