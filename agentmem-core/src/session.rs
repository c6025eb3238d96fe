//! Per-agent sessions and their bounded working memory.
//!
//! Working memory is a rolling buffer of the most recent steps within one
//! session. It is deliberately not shared across agents; cross-agent state
//! flows through the episodic, semantic, and skill stores instead.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock as _, SharedClock};
use crate::error::{Error, Result};
use crate::record::Step;

/// Bounded FIFO buffer of the most recent steps in one session.
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    capacity: usize,
    steps: VecDeque<Step>,
}

impl WorkingMemory {
    /// Create a buffer holding at most `capacity` steps.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            steps: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a step, dropping the oldest when full.
    pub fn push(&mut self, step: Step) {
        if self.steps.len() == self.capacity {
            self.steps.pop_front();
        }
        self.steps.push_back(step);
    }

    /// The last `k` steps in execution order.
    #[must_use]
    pub fn recent(&self, k: usize) -> Vec<Step> {
        let start = self.steps.len().saturating_sub(k);
        self.steps.iter().skip(start).cloned().collect()
    }

    /// Number of buffered steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check whether the buffer holds no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of buffered steps that succeeded.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let successes = self.steps.iter().filter(|s| s.success).count();
        #[allow(clippy::cast_precision_loss)]
        {
            successes as f64 / self.steps.len() as f64
        }
    }

    /// Mean importance of buffered steps.
    #[must_use]
    pub fn mean_importance(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.steps.iter().map(|s| s.importance).sum();
        #[allow(clippy::cast_precision_loss)]
        {
            sum / self.steps.len() as f64
        }
    }

    /// Drain every buffered step, oldest first.
    #[must_use]
    pub fn drain(&mut self) -> Vec<Step> {
        self.steps.drain(..).collect()
    }
}

/// One agent session with its working memory.
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session identifier
    pub session_id: Uuid,
    /// Owning agent
    pub agent_id: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent activity
    pub last_activity: DateTime<Utc>,
    /// Rolling step buffer
    pub working: WorkingMemory,
}

/// Serializable session metadata mirrored into the shared KV.
///
/// The step buffer itself stays in-process; peers only see that the session
/// exists and when it was last active.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SessionRecord {
    /// On-disk schema revision
    #[serde(default = "crate::record::default_schema_version")]
    pub schema_version: u16,
    /// Unique session identifier
    pub session_id: Uuid,
    /// Owning agent
    pub agent_id: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent activity
    pub last_activity: DateTime<Utc>,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            schema_version: crate::record::SCHEMA_VERSION,
            session_id: session.session_id,
            agent_id: session.agent_id.clone(),
            created_at: session.created_at,
            last_activity: session.last_activity,
        }
    }
}

/// Registry of live sessions with idle-TTL expiry.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Session>>,
    working_capacity: usize,
    clock: SharedClock,
}

impl SessionRegistry {
    /// Create a registry; each session's buffer holds `working_capacity` steps.
    #[must_use]
    pub fn new(working_capacity: usize, clock: SharedClock) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            working_capacity,
            clock,
        }
    }

    /// Create a session for an agent and return its id.
    pub fn create(&self, agent_id: impl Into<String>) -> Uuid {
        let now = self.clock.now();
        let session = Session {
            session_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            created_at: now,
            last_activity: now,
            working: WorkingMemory::new(self.working_capacity),
        };
        let session_id = session.session_id;
        debug!(session_id = %session_id, agent_id = %session.agent_id, "created session");
        self.sessions.lock().insert(session_id, session);
        session_id
    }

    /// Append a step to a session's working memory.
    pub fn add_step(&self, session_id: Uuid, step: Step) -> Result<()> {
        step.validate()?;
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&session_id)
            .ok_or(Error::NotFound(session_id))?;
        session.working.push(step);
        session.last_activity = self.clock.now();
        Ok(())
    }

    /// The last `k` steps of a session, oldest first.
    pub fn context(&self, session_id: Uuid, k: usize) -> Result<Vec<Step>> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(&session_id)
            .ok_or(Error::NotFound(session_id))?;
        Ok(session.working.recent(k))
    }

    /// Snapshot of one session.
    pub fn get(&self, session_id: Uuid) -> Result<Session> {
        self.sessions
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or(Error::NotFound(session_id))
    }

    /// Close a session, returning its remaining buffered steps.
    pub fn close(&self, session_id: Uuid) -> Result<Vec<Step>> {
        let mut sessions = self.sessions.lock();
        let mut session = sessions
            .remove(&session_id)
            .ok_or(Error::NotFound(session_id))?;
        debug!(session_id = %session_id, "closed session");
        Ok(session.working.drain())
    }

    /// Remove sessions idle longer than `idle_ttl`; returns the removed ids.
    pub fn expire_idle(&self, idle_ttl: std::time::Duration) -> Vec<Uuid> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        let expired: Vec<Uuid> = sessions
            .values()
            .filter(|s| {
                now.signed_duration_since(s.last_activity)
                    .to_std()
                    .is_ok_and(|idle| idle > idle_ttl)
            })
            .map(|s| s.session_id)
            .collect();
        for session_id in &expired {
            sessions.remove(session_id);
            debug!(session_id = %session_id, "expired idle session");
        }
        expired
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Check whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn step(session_id: Uuid, action: &str) -> Step {
        Step::new(session_id, action, "ok", Utc::now())
    }

    #[test]
    fn test_ring_buffer_keeps_most_recent_in_order() {
        let mut wm = WorkingMemory::new(3);
        let sid = Uuid::new_v4();
        for i in 0..5 {
            wm.push(step(sid, &format!("action-{i}")));
        }
        assert_eq!(wm.len(), 3);
        let actions: Vec<String> = wm.recent(3).into_iter().map(|s| s.action).collect();
        assert_eq!(actions, vec!["action-2", "action-3", "action-4"]);
    }

    #[test]
    fn test_recent_with_k_smaller_than_len() {
        let mut wm = WorkingMemory::new(10);
        let sid = Uuid::new_v4();
        for i in 0..5 {
            wm.push(step(sid, &format!("a{i}")));
        }
        let last_two = wm.recent(2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].action, "a3");
        assert_eq!(last_two[1].action, "a4");
    }

    #[test]
    fn test_registry_round_trip() {
        let registry = SessionRegistry::new(50, ManualClock::shared());
        let session_id = registry.create("agent-1");

        registry
            .add_step(session_id, step(session_id, "navigate"))
            .unwrap();
        registry
            .add_step(session_id, step(session_id, "extract"))
            .unwrap();

        let context = registry.context(session_id, 10).unwrap();
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].action, "navigate");
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let registry = SessionRegistry::new(50, ManualClock::shared());
        let missing = Uuid::new_v4();
        assert!(matches!(
            registry.context(missing, 5),
            Err(Error::NotFound(id)) if id == missing
        ));
    }

    #[test]
    fn test_idle_sessions_expire() {
        let clock = ManualClock::shared();
        let registry = SessionRegistry::new(50, clock.clone());
        let stale = registry.create("agent-1");
        clock.advance(Duration::from_secs(3601));
        let fresh = registry.create("agent-2");

        let expired = registry.expire_idle(Duration::from_secs(3600));
        assert_eq!(expired, vec![stale]);
        assert!(registry.get(fresh).is_ok());
        assert!(registry.get(stale).is_err());
    }

    #[test]
    fn test_close_returns_buffered_steps() {
        let registry = SessionRegistry::new(50, ManualClock::shared());
        let session_id = registry.create("agent-1");
        registry
            .add_step(session_id, step(session_id, "navigate"))
            .unwrap();

        let steps = registry.close(session_id).unwrap();
        assert_eq!(steps.len(), 1);
        assert!(registry.get(session_id).is_err());
    }

    #[test]
    fn test_success_rate_and_importance() {
        let mut wm = WorkingMemory::new(4);
        let sid = Uuid::new_v4();
        let mut failing = step(sid, "x");
        failing.success = false;
        failing.importance = 1.0;
        wm.push(step(sid, "a"));
        wm.push(failing);
        assert!((wm.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!((wm.mean_importance() - 0.75).abs() < f64::EPSILON);
    }
}
