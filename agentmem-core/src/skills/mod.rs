//! Skill library: content-addressed reusable action sequences with
//! validation, versioning, optimistic locking, and batched execution.

mod executor;
mod history;
mod library;

pub use executor::{
    ExecutionContext, ScriptedExecutor, ScriptedOutcome, SkillError, SkillExecutor,
};
pub use history::SkillHistoryLog;
pub use library::{
    ComposedStep, ComposedStepStatus, CompositionReport, ExecutionReport, SkillLibrary,
};
