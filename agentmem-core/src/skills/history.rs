//! Append-only skill version history.
//!
//! Each skill gets one JSON-lines log file under `skills_history/`. Appends
//! run under the cross-process file lock so concurrent processes interleave
//! whole lines, never bytes.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::record::SkillVersion;
use crate::store::SKILL_FILE_RESOURCE;

/// Append-only per-skill revision log.
pub struct SkillHistoryLog {
    dir: PathBuf,
    locks: Arc<LockManager>,
}

impl SkillHistoryLog {
    /// Create a log rooted at `dir` (typically `<data_dir>/skills_history`).
    #[must_use]
    pub fn new(dir: PathBuf, locks: Arc<LockManager>) -> Self {
        Self { dir, locks }
    }

    fn log_path(&self, skill_id: Uuid) -> PathBuf {
        self.dir.join(format!("{skill_id}.log"))
    }

    /// Append one superseded revision.
    pub async fn append(&self, version: &SkillVersion) -> Result<()> {
        let _guard = self.locks.process_lock(SKILL_FILE_RESOURCE).await?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_vec(version)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(version.skill_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(
            skill_id = %version.skill_id,
            version = version.version,
            "appended skill revision to history"
        );
        Ok(())
    }

    /// All saved revisions of a skill, ascending by version.
    pub async fn read_all(&self, skill_id: Uuid) -> Result<Vec<SkillVersion>> {
        let path = self.log_path(skill_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut versions = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let version: SkillVersion = serde_json::from_str(line).map_err(|e| {
                Error::Corruption(format!("skill history line for {skill_id} is invalid: {e}"))
            })?;
            versions.push(version);
        }
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    /// One saved revision, or [`Error::NotFound`] when absent.
    pub async fn read_version(&self, skill_id: Uuid, version: u32) -> Result<SkillVersion> {
        self.read_all(skill_id)
            .await?
            .into_iter()
            .find(|v| v.version == version)
            .ok_or(Error::NotFound(skill_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::record::{ActionStep, Skill, SkillCategory};
    use chrono::Utc;
    use tempfile::TempDir;

    fn log(dir: &TempDir) -> SkillHistoryLog {
        let locks = LockManager::new(&dir.path().join("locks"), LockConfig::default());
        SkillHistoryLog::new(dir.path().join("skills_history"), locks)
    }

    fn skill_version(skill: &Skill) -> SkillVersion {
        SkillVersion::of(skill, Utc::now())
    }

    #[tokio::test]
    async fn test_append_and_read_back_in_version_order() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);

        let mut skill = Skill::new(
            "login",
            "desc",
            SkillCategory::Authentication,
            vec![ActionStep::new("s", "a")],
            Utc::now(),
        );
        let v1 = skill_version(&skill);
        skill.version = 2;
        let v2 = skill_version(&skill);

        // Append out of order; reads come back sorted.
        log.append(&v2).await.unwrap();
        log.append(&v1).await.unwrap();

        let all = log.read_all(skill.skill_id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].version, 1);
        assert_eq!(all[1].version, 2);

        let found = log.read_version(skill.skill_id, 2).await.unwrap();
        assert_eq!(found.version, 2);
    }

    #[tokio::test]
    async fn test_missing_history_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);
        assert!(log.read_all(Uuid::new_v4()).await.unwrap().is_empty());
        assert!(matches!(
            log.read_version(Uuid::new_v4(), 1).await,
            Err(Error::NotFound(_))
        ));
    }
}
