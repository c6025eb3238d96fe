//! Tiered memory stores over the locking and backend substrate.
//!
//! Each store pins one lock-manager resource name: writes go through the
//! resource's write lock, reads through its read lock, and the payloads
//! through the backend adapter. Retrieval-index updates are best-effort for
//! writes and fatal for searches.

mod episodic;
mod semantic;
mod skill;

pub use episodic::EpisodicStore;
pub use semantic::SemanticStore;
pub use skill::SkillStore;

/// Lock-manager resource name of the episodic tier.
pub const EPISODIC_RESOURCE: &str = "episodic";
/// Lock-manager resource name of the semantic tier.
pub const SEMANTIC_RESOURCE: &str = "semantic";
/// Lock-manager resource name of the skill tier.
pub const SKILL_RESOURCE: &str = "skill_library";
/// Lock-manager resource name of skill history file I/O.
pub const SKILL_FILE_RESOURCE: &str = "skill_library:file";

// Upper bound on a single durable scan; tiers are filtered in memory after.
pub(crate) const SCAN_ALL: usize = usize::MAX;

pub(crate) fn check_limit(limit: usize, max: usize) -> crate::error::Result<()> {
    if limit == 0 {
        return Err(crate::error::Error::Validation(
            "limit must be at least 1".to_string(),
        ));
    }
    if limit > max {
        return Err(crate::error::Error::Validation(format!(
            "limit {limit} exceeds maximum of {max}"
        )));
    }
    Ok(())
}
