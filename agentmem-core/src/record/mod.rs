//! Record types persisted by the substrate: steps, episodes, semantic
//! patterns, skills, and their filters and partial updates.
//!
//! Every persisted record carries a `schema_version` so future revisions can
//! migrate old payloads on read.

mod episode;
mod pattern;
mod skill;
mod step;

pub use episode::{Episode, EpisodeFilter, EpisodeUpdate};
pub use pattern::{PatternFilter, PatternKind, SemanticPattern, confidence_for};
pub use skill::{
    ActionStep, ParameterSpec, ParameterType, Skill, SkillCategory, SkillFilter, SkillStats,
    SkillStatus, SkillVersion,
};
pub use step::{Step, ToolCall};

/// Current on-disk schema revision for all record types.
pub const SCHEMA_VERSION: u16 = 1;

pub(crate) fn default_schema_version() -> u16 {
    SCHEMA_VERSION
}
