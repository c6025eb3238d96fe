//! High-level skill API: versioned add, retrieval, execution, batching,
//! and ordered composition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{ExecutionContext, SkillExecutor};
use super::history::SkillHistoryLog;
use crate::clock::{Clock as _, SharedClock};
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::record::{Skill, SkillFilter, SkillStats, SkillStatus, SkillVersion};
use crate::store::SkillStore;

/// Outcome of one successful skill execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Executed skill
    pub skill_id: Uuid,
    /// Output value returned by the executor
    pub output: serde_json::Value,
    /// Observed execution duration
    pub duration: Duration,
    /// Context after execution, including executor mutations
    pub context: ExecutionContext,
}

/// What happened to one step of a composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposedStepStatus {
    /// Ran to completion
    Executed,
    /// Skipped: recoverable failure, or unreached after a fatal one
    Skipped,
    /// Failed fatally; composition stopped here
    Failed,
}

/// Per-step composition record, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedStep {
    /// Position in the input sequence
    pub index: usize,
    /// Skill at this position
    pub skill_id: Uuid,
    /// Outcome classification
    pub status: ComposedStepStatus,
    /// Output when executed
    pub output: Option<serde_json::Value>,
    /// Failure description when skipped or failed
    pub error: Option<String>,
}

/// Result of `compose`: one entry per input skill, plus the final context.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositionReport {
    /// Per-step outcomes, in input order
    pub steps: Vec<ComposedStep>,
    /// Index of the fatally failed step, if composition stopped early
    pub failed_index: Option<usize>,
    /// Shared context after the last attempted step
    pub context: ExecutionContext,
}

/// User-facing facade over the skill store, version history, and executor.
pub struct SkillLibrary {
    store: Arc<SkillStore>,
    history: SkillHistoryLog,
    executor: Arc<dyn SkillExecutor>,
    clock: SharedClock,
    config: MemoryConfig,
}

impl SkillLibrary {
    /// Compose the facade.
    #[must_use]
    pub fn new(
        store: Arc<SkillStore>,
        history: SkillHistoryLog,
        executor: Arc<dyn SkillExecutor>,
        clock: SharedClock,
        config: MemoryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            history,
            executor,
            clock,
            config,
        })
    }

    /// Add a skill, or publish a new revision of an existing one.
    ///
    /// With `validate` the skill is checked and activated (draft -> active);
    /// deprecated skills cannot be revived. With `expected_version` the call
    /// is optimistic: it fails with [`Error::VersionConflict`] unless the
    /// stored version still equals it. On an accepted update the version is
    /// bumped by exactly one and the superseded revision is appended to the
    /// history log.
    pub async fn add_skill(
        &self,
        mut skill: Skill,
        validate: bool,
        expected_version: Option<u32>,
    ) -> Result<Skill> {
        if validate {
            skill.validate()?;
            match skill.status {
                SkillStatus::Draft => skill.status = SkillStatus::Active,
                SkillStatus::Active => {}
                SkillStatus::Deprecated => {
                    return Err(Error::Validation(format!(
                        "skill '{}' is deprecated; publish a new skill instead",
                        skill.name
                    )));
                }
            }
        }
        skill.content_hash = skill.compute_content_hash();
        skill.updated_at = self.clock.now();

        let (stored, prior) = self
            .store
            .upsert_versioned(skill, expected_version, true)
            .await?;

        if let Some(prior) = prior {
            let snapshot = SkillVersion::of(&prior, self.clock.now());
            if let Err(e) = self.history.append(&snapshot).await {
                warn!(
                    skill_id = %prior.skill_id,
                    version = prior.version,
                    error = %e,
                    "failed to append skill revision to history"
                );
            }
        }

        info!(
            skill_id = %stored.skill_id,
            name = %stored.name,
            version = stored.version,
            "skill stored"
        );
        Ok(stored)
    }

    /// Add several skills; each entry succeeds or fails independently.
    pub async fn batch_add_skills(
        &self,
        skills: Vec<Skill>,
        validate: bool,
    ) -> Vec<(Uuid, Result<Skill>)> {
        let mut results = Vec::with_capacity(skills.len());
        for skill in skills {
            let skill_id = skill.skill_id;
            results.push((skill_id, self.add_skill(skill, validate, None).await));
        }
        results
    }

    /// Fetch a skill by id.
    pub async fn get_skill(&self, skill_id: Uuid) -> Result<Skill> {
        self.store.get(skill_id).await
    }

    /// Fetch the active skill with the given name.
    pub async fn get_skill_by_name(&self, name: &str) -> Result<Skill> {
        self.store.get_by_name(name).await
    }

    /// Similarity search over active skills, optionally post-filtered.
    pub async fn search_skills(
        &self,
        query: &str,
        filter: Option<&SkillFilter>,
        limit: usize,
    ) -> Result<Vec<Skill>> {
        let mut skills = self.store.search(query, limit).await?;
        if let Some(filter) = filter {
            skills.retain(|skill| filter.matches(skill));
        }
        Ok(skills)
    }

    /// Usage statistics snapshot for one skill.
    pub async fn skill_stats(&self, skill_id: Uuid) -> Result<SkillStats> {
        Ok(SkillStats::from(&self.store.get(skill_id).await?))
    }

    /// Current version number of a skill.
    pub async fn get_version(&self, skill_id: Uuid) -> Result<u32> {
        Ok(self.store.get(skill_id).await?.version)
    }

    /// One revision of a skill: the live one, or a saved prior revision.
    pub async fn get_version_record(&self, skill_id: Uuid, version: u32) -> Result<SkillVersion> {
        let current = self.store.get(skill_id).await?;
        if current.version == version {
            return Ok(SkillVersion::of(&current, current.updated_at));
        }
        self.history.read_version(skill_id, version).await
    }

    /// All saved prior revisions, ascending by version.
    pub async fn get_version_history(&self, skill_id: Uuid) -> Result<Vec<SkillVersion>> {
        // Verify the skill exists so an unknown id is NotFound, not empty.
        let _ = self.store.get(skill_id).await?;
        self.history.read_all(skill_id).await
    }

    /// Deprecate a skill, optionally naming its active replacement.
    pub async fn deprecate_skill(
        &self,
        skill_id: Uuid,
        replacement_id: Option<Uuid>,
    ) -> Result<Skill> {
        self.store.deprecate(skill_id, replacement_id).await
    }

    /// Execute an active skill under a deadline.
    ///
    /// The context is validated against the declared parameters before the
    /// executor runs (fail fast, nothing recorded). The execution outcome,
    /// including timeouts, is folded into the skill's statistics.
    pub async fn execute_skill(
        &self,
        skill_id: Uuid,
        context: ExecutionContext,
        timeout: Duration,
    ) -> Result<ExecutionReport> {
        let skill = self.store.get(skill_id).await?;
        if skill.status != SkillStatus::Active {
            return Err(Error::Validation(format!(
                "skill '{}' is not active",
                skill.name
            )));
        }
        skill.validate_context(&context)?;

        let mut context = context;
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.executor.execute(&skill, &mut context)).await {
            Ok(Ok(output)) => {
                let duration = started.elapsed();
                self.record_outcome(skill_id, true, duration).await;
                debug!(skill_id = %skill_id, ?duration, "skill executed");
                Ok(ExecutionReport {
                    skill_id,
                    output,
                    duration,
                    context,
                })
            }
            Ok(Err(skill_error)) => {
                self.record_outcome(skill_id, false, started.elapsed()).await;
                Err(Error::Validation(skill_error.message))
            }
            Err(_elapsed) => {
                self.record_outcome(skill_id, false, timeout).await;
                Err(Error::timeout(
                    format!("execution of skill '{}'", skill.name),
                    timeout,
                ))
            }
        }
    }

    async fn record_outcome(&self, skill_id: Uuid, success: bool, duration: Duration) {
        if let Err(e) = self.store.record_execution(skill_id, success, duration).await {
            warn!(skill_id = %skill_id, error = %e, "failed to record skill execution");
        }
    }

    /// Execute up to `max_concurrent` skills in parallel.
    ///
    /// Each pair gets its own result; a failure in one execution never
    /// affects the others. Results come back in input order.
    pub async fn batch_execute_skills(
        &self,
        pairs: Vec<(Uuid, ExecutionContext)>,
        timeout_per_skill: Duration,
        max_concurrent: usize,
    ) -> Result<Vec<(Uuid, Result<ExecutionReport>)>> {
        if max_concurrent == 0 {
            return Err(Error::Validation(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if max_concurrent > self.config.max_batch_concurrency {
            return Err(Error::Validation(format!(
                "max_concurrent {} exceeds limit of {}",
                max_concurrent, self.config.max_batch_concurrency
            )));
        }

        let semaphore = Semaphore::new(max_concurrent);
        let executions = pairs.into_iter().map(|(skill_id, context)| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::Internal("batch semaphore closed".to_string()));
                let outcome = match _permit {
                    Ok(_permit) => {
                        self.execute_skill(skill_id, context, timeout_per_skill)
                            .await
                    }
                    Err(e) => Err(e),
                };
                (skill_id, outcome)
            }
        });
        let results = futures::future::join_all(executions).await;
        Ok(results)
    }

    /// Execute skills strictly in order, threading one mutable context
    /// through all of them.
    ///
    /// Recoverable failures skip the step; fatal failures stop the
    /// composition, and unreached steps are reported as skipped. Every input
    /// skill gets exactly one entry in the report, in input order.
    pub async fn compose_skills(
        &self,
        skill_ids: &[Uuid],
        context: ExecutionContext,
        timeout_per_skill: Duration,
    ) -> Result<CompositionReport> {
        let mut steps: Vec<ComposedStep> = Vec::with_capacity(skill_ids.len());
        let mut shared = context;
        let mut failed_index = None;

        for (index, &skill_id) in skill_ids.iter().enumerate() {
            if failed_index.is_some() {
                steps.push(ComposedStep {
                    index,
                    skill_id,
                    status: ComposedStepStatus::Skipped,
                    output: None,
                    error: Some("unreached: composition stopped earlier".to_string()),
                });
                continue;
            }

            let skill = match self.store.get(skill_id).await {
                Ok(skill) if skill.status == SkillStatus::Active => skill,
                Ok(skill) => {
                    failed_index = Some(index);
                    steps.push(ComposedStep {
                        index,
                        skill_id,
                        status: ComposedStepStatus::Failed,
                        output: None,
                        error: Some(format!("skill '{}' is not active", skill.name)),
                    });
                    continue;
                }
                Err(e) => {
                    failed_index = Some(index);
                    steps.push(ComposedStep {
                        index,
                        skill_id,
                        status: ComposedStepStatus::Failed,
                        output: None,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            // Missing parameters are a recoverable precondition failure at
            // composition level: skip the step, keep going.
            if let Err(e) = skill.validate_context(&shared) {
                steps.push(ComposedStep {
                    index,
                    skill_id,
                    status: ComposedStepStatus::Skipped,
                    output: None,
                    error: Some(e.to_string()),
                });
                continue;
            }

            let started = Instant::now();
            match tokio::time::timeout(
                timeout_per_skill,
                self.executor.execute(&skill, &mut shared),
            )
            .await
            {
                Ok(Ok(output)) => {
                    self.record_outcome(skill_id, true, started.elapsed()).await;
                    steps.push(ComposedStep {
                        index,
                        skill_id,
                        status: ComposedStepStatus::Executed,
                        output: Some(output),
                        error: None,
                    });
                }
                Ok(Err(skill_error)) => {
                    self.record_outcome(skill_id, false, started.elapsed()).await;
                    if skill_error.recoverable {
                        steps.push(ComposedStep {
                            index,
                            skill_id,
                            status: ComposedStepStatus::Skipped,
                            output: None,
                            error: Some(skill_error.message),
                        });
                    } else {
                        failed_index = Some(index);
                        steps.push(ComposedStep {
                            index,
                            skill_id,
                            status: ComposedStepStatus::Failed,
                            output: None,
                            error: Some(skill_error.message),
                        });
                    }
                }
                Err(_elapsed) => {
                    self.record_outcome(skill_id, false, timeout_per_skill).await;
                    failed_index = Some(index);
                    steps.push(ComposedStep {
                        index,
                        skill_id,
                        status: ComposedStepStatus::Failed,
                        output: None,
                        error: Some(format!(
                            "execution of skill '{}' timed out",
                            skill.name
                        )),
                    });
                }
            }
        }

        Ok(CompositionReport {
            steps,
            failed_index,
            context: shared,
        })
    }
}
