//! Skills: named, versioned, reusable action sequences.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::record::{SCHEMA_VERSION, default_schema_version};

/// Lifecycle state of a skill.
///
/// `Draft -> Active` on validation, `Active -> Deprecated` on deprecation or
/// replacement. There is no transition out of `Deprecated`; publish a new
/// skill instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillStatus {
    /// Authored but not yet validated
    Draft,
    /// Validated and retrievable
    Active,
    /// Retired; retained for history but excluded from active retrieval
    Deprecated,
}

/// Closed category set for skills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillCategory {
    /// Page navigation and URL handling
    Navigation,
    /// Reading data out of pages
    Extraction,
    /// Filling and submitting forms
    FormFilling,
    /// Login and credential flows
    Authentication,
    /// File and media downloads
    Download,
    /// Waiting, retrying, and other glue behavior
    Utility,
}

/// Type of a declared skill parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    /// UTF-8 text
    String,
    /// Numeric (integer or float)
    Number,
    /// True/false
    Boolean,
    /// Arbitrary structured JSON
    Json,
}

impl ParameterType {
    fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Json => true,
        }
    }
}

/// One declared input of a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name, unique within the skill
    pub name: String,
    /// Expected type
    pub param_type: ParameterType,
    /// Whether execution fails fast when the parameter is missing
    pub required: bool,
    /// Optional human description
    #[serde(default)]
    pub description: Option<String>,
}

impl ParameterSpec {
    /// Required parameter of the given type.
    #[must_use]
    pub fn required(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            description: None,
        }
    }

    /// Optional parameter of the given type.
    #[must_use]
    pub fn optional(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            description: None,
        }
    }
}

/// One named step of a skill's action sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    /// Step name, used in composition reports
    pub name: String,
    /// Action the executor should perform
    pub action: String,
    /// Arguments, possibly referencing declared parameters
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ActionStep {
    /// Create an action step.
    #[must_use]
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            arguments: serde_json::Value::Null,
        }
    }
}

/// A reusable, parameterized action sequence with usage statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    /// On-disk schema revision
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    /// Unique skill identifier, stable across versions
    pub skill_id: Uuid,
    /// Name, unique among active skills
    pub name: String,
    /// Human description
    pub description: String,
    /// Category from the closed set
    pub category: SkillCategory,
    /// Lifecycle state
    pub status: SkillStatus,
    /// Ordered action sequence
    pub action_sequence: Vec<ActionStep>,
    /// Declared inputs validated before execution
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Predicates that must hold before execution
    #[serde(default)]
    pub preconditions: BTreeSet<String>,
    /// Predicates expected to hold afterwards
    #[serde(default)]
    pub postconditions: BTreeSet<String>,
    /// Free-form tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Fraction of successful executions
    pub success_rate: f64,
    /// Exponentially weighted average execution duration
    pub avg_duration_seconds: f64,
    /// Total recorded executions
    pub usage_count: u64,
    /// Successful recorded executions
    pub success_count: u64,
    /// Revision number; increases by exactly 1 on each accepted update
    pub version: u32,
    /// Stable hash of the action sequence and declared parameters
    pub content_hash: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last accepted update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Skill {
    /// Create a draft skill at version 1.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: SkillCategory,
        action_sequence: Vec<ActionStep>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut skill = Self {
            schema_version: SCHEMA_VERSION,
            skill_id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            category,
            status: SkillStatus::Draft,
            action_sequence,
            parameters: Vec::new(),
            preconditions: BTreeSet::new(),
            postconditions: BTreeSet::new(),
            tags: BTreeSet::new(),
            success_rate: 0.0,
            avg_duration_seconds: 0.0,
            usage_count: 0,
            success_count: 0,
            version: 1,
            content_hash: String::new(),
            created_at: now,
            updated_at: now,
        };
        skill.content_hash = skill.compute_content_hash();
        skill
    }

    /// Stable hex hash over the skill's name, action sequence, and declared
    /// parameters. Statistics and lifecycle state do not affect it.
    #[must_use]
    pub fn compute_content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for step in &self.action_sequence {
            hasher.update(step.name.as_bytes());
            hasher.update([0]);
            hasher.update(step.action.as_bytes());
            hasher.update([0]);
            // serde_json::Value maps are sorted, so this rendering is stable.
            hasher.update(step.arguments.to_string().as_bytes());
            hasher.update([0]);
        }
        for param in &self.parameters {
            hasher.update(param.name.as_bytes());
            hasher.update([0]);
            hasher.update(format!("{:?}:{}", param.param_type, param.required).as_bytes());
            hasher.update([0]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Check field constraints. Used both on add and on validation to active.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("skill name must not be empty".into()));
        }
        if self.action_sequence.is_empty() {
            return Err(Error::Validation(format!(
                "skill '{}' has an empty action sequence",
                self.name
            )));
        }
        if self
            .action_sequence
            .iter()
            .any(|step| step.name.trim().is_empty() || step.action.trim().is_empty())
        {
            return Err(Error::Validation(format!(
                "skill '{}' has an action step with an empty name or action",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.success_rate) {
            return Err(Error::Validation(format!(
                "skill success_rate {} outside [0, 1]",
                self.success_rate
            )));
        }
        if self.avg_duration_seconds < 0.0 {
            return Err(Error::Validation(
                "skill avg_duration_seconds is negative".into(),
            ));
        }
        if self.version == 0 {
            return Err(Error::Validation("skill version must be at least 1".into()));
        }
        let mut seen = BTreeSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(Error::Validation(format!(
                    "skill '{}' declares parameter '{}' twice",
                    self.name, param.name
                )));
            }
        }
        Ok(())
    }

    /// Validate an execution context against the declared parameters.
    ///
    /// Fails fast on missing required parameters and type mismatches.
    pub fn validate_context(&self, context: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        for param in &self.parameters {
            match context.get(&param.name) {
                None if param.required => {
                    return Err(Error::Validation(format!(
                        "missing required parameter '{}' for skill '{}'",
                        param.name, self.name
                    )));
                }
                None => {}
                Some(value) => {
                    if !param.param_type.accepts(value) {
                        return Err(Error::Validation(format!(
                            "parameter '{}' of skill '{}' has wrong type",
                            param.name, self.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Fold one execution into the usage statistics.
    ///
    /// `beta` is the EWMA factor for the average duration.
    pub fn record_execution(&mut self, success: bool, duration: std::time::Duration, beta: f64) {
        self.usage_count += 1;
        if success {
            self.success_count += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.success_rate = self.success_count as f64 / self.usage_count as f64;
        }
        let duration_secs = duration.as_secs_f64();
        if self.usage_count == 1 {
            self.avg_duration_seconds = duration_secs;
        } else {
            self.avg_duration_seconds =
                (1.0 - beta) * self.avg_duration_seconds + beta * duration_secs;
        }
    }

    /// Searchable text used by the retrieval index.
    #[must_use]
    pub fn index_text(&self) -> String {
        let mut text = format!("{} {}", self.name, self.description);
        for tag in &self.tags {
            text.push(' ');
            text.push_str(tag);
        }
        for step in &self.action_sequence {
            text.push(' ');
            text.push_str(&step.action);
        }
        text
    }
}

/// Immutable record of a prior skill revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillVersion {
    /// On-disk schema revision
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    /// Skill this revision belongs to
    pub skill_id: Uuid,
    /// Revision number
    pub version: u32,
    /// Content hash at this revision
    pub content_hash: String,
    /// When the revision was superseded
    pub saved_at: DateTime<Utc>,
    /// Full skill payload at this revision
    pub skill: Skill,
}

impl SkillVersion {
    /// Snapshot a skill about to be superseded.
    #[must_use]
    pub fn of(skill: &Skill, saved_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            skill_id: skill.skill_id,
            version: skill.version,
            content_hash: skill.content_hash.clone(),
            saved_at,
            skill: skill.clone(),
        }
    }
}

/// Usage statistics snapshot for one skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillStats {
    /// Skill identifier
    pub skill_id: Uuid,
    /// Total recorded executions
    pub usage_count: u64,
    /// Fraction of successful executions
    pub success_rate: f64,
    /// EWMA execution duration
    pub avg_duration_seconds: f64,
    /// Current revision
    pub version: u32,
}

impl From<&Skill> for SkillStats {
    fn from(skill: &Skill) -> Self {
        Self {
            skill_id: skill.skill_id,
            usage_count: skill.usage_count,
            success_rate: skill.success_rate,
            avg_duration_seconds: skill.avg_duration_seconds,
            version: skill.version,
        }
    }
}

/// Filter for skill queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillFilter {
    /// Restrict to one category
    pub category: Option<SkillCategory>,
    /// Restrict to one lifecycle state
    pub status: Option<SkillStatus>,
    /// Required tags (all must be present)
    pub tags: BTreeSet<String>,
    /// Minimum success rate
    pub min_success_rate: Option<f64>,
}

impl SkillFilter {
    /// Match only active skills.
    #[must_use]
    pub fn active() -> Self {
        Self {
            status: Some(SkillStatus::Active),
            ..Self::default()
        }
    }

    /// Check whether a skill satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, skill: &Skill) -> bool {
        if let Some(category) = self.category {
            if skill.category != category {
                return false;
            }
        }
        if let Some(status) = self.status {
            if skill.status != status {
                return false;
            }
        }
        if !self.tags.is_subset(&skill.tags) {
            return false;
        }
        if let Some(min) = self.min_success_rate {
            if skill.success_rate < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_skill() -> Skill {
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
            ParameterSpec::optional("remember_me", ParameterType::Boolean),
        ];
        skill
    }

    #[test]
    fn test_new_skill_starts_as_draft_v1() {
        let skill = login_skill();
        assert_eq!(skill.status, SkillStatus::Draft);
        assert_eq!(skill.version, 1);
        assert!(!skill.content_hash.is_empty());
        assert!(skill.validate().is_ok());
    }

    #[test]
    fn test_content_hash_ignores_statistics() {
        let mut skill = login_skill();
        let hash = skill.compute_content_hash();
        skill.record_execution(true, std::time::Duration::from_secs(2), 0.2);
        assert_eq!(skill.compute_content_hash(), hash);
    }

    #[test]
    fn test_content_hash_tracks_action_changes() {
        let mut skill = login_skill();
        let hash = skill.compute_content_hash();
        skill.action_sequence.push(ActionStep::new("verify", "check avatar"));
        assert_ne!(skill.compute_content_hash(), hash);
    }

    #[test]
    fn test_empty_action_sequence_rejected() {
        let mut skill = login_skill();
        skill.action_sequence.clear();
        assert!(matches!(skill.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_context_validation_fails_fast_on_missing_required() {
        let skill = login_skill();
        let mut context = serde_json::Map::new();
        context.insert("username".to_string(), serde_json::json!("alice"));
        let err = skill.validate_context(&context).unwrap_err();
        assert!(err.to_string().contains("password"));

        context.insert("password".to_string(), serde_json::json!("hunter2"));
        assert!(skill.validate_context(&context).is_ok());
    }

    #[test]
    fn test_context_validation_checks_types() {
        let skill = login_skill();
        let mut context = serde_json::Map::new();
        context.insert("username".to_string(), serde_json::json!("alice"));
        context.insert("password".to_string(), serde_json::json!(42));
        assert!(skill.validate_context(&context).is_err());
    }

    #[test]
    fn test_record_execution_updates_rate_and_ewma() {
        let mut skill = login_skill();
        skill.record_execution(true, std::time::Duration::from_secs(10), 0.2);
        assert!((skill.success_rate - 1.0).abs() < f64::EPSILON);
        assert!((skill.avg_duration_seconds - 10.0).abs() < f64::EPSILON);

        skill.record_execution(false, std::time::Duration::from_secs(20), 0.2);
        assert!((skill.success_rate - 0.5).abs() < f64::EPSILON);
        // EWMA: 0.8 * 10 + 0.2 * 20 = 12
        assert!((skill.avg_duration_seconds - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_version_snapshot_captures_payload() {
        let skill = login_skill();
        let snapshot = SkillVersion::of(&skill, Utc::now());
        assert_eq!(snapshot.skill_id, skill.skill_id);
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.content_hash, skill.content_hash);
        assert_eq!(snapshot.skill, skill);
    }

    #[test]
    fn test_filter_active_only() {
        let mut skill = login_skill();
        assert!(!SkillFilter::active().matches(&skill));
        skill.status = SkillStatus::Active;
        assert!(SkillFilter::active().matches(&skill));
        skill.status = SkillStatus::Deprecated;
        assert!(!SkillFilter::active().matches(&skill));
    }

    #[test]
    fn test_duplicate_parameter_names_rejected() {
        let mut skill = login_skill();
        skill
            .parameters
            .push(ParameterSpec::optional("username", ParameterType::String));
        assert!(skill.validate().is_err());
    }
}
