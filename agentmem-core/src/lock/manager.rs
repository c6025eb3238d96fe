//! Process-wide lock registry.
//!
//! One manager per runtime maps resource names to their RW and process
//! locks, so concurrent components contend on the same primitives exactly
//! when they name the same resource. Locks are never garbage-collected while
//! the manager lives; `get`-style lookups are idempotent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::process::{ProcessLock, ProcessLockGuard};
use super::rw::{FairRwLock, RwLockStatus, RwReadGuard, RwWriteGuard};
use super::stats::{KindStats, LockKind, StatsCell};
use crate::config::LockConfig;
use crate::error::Result;

/// Statistics for every lock kind of one resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceLockStats {
    /// Shared-side counters
    pub read: KindStats,
    /// Exclusive-side counters
    pub write: KindStats,
    /// Cross-process lock counters
    pub process: KindStats,
}

/// Holders/waiters snapshot for one resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceLockStatus {
    /// RW lock holders and queues
    pub rw: RwLockStatus,
    /// Whether the process lock is held by this process
    pub process_held: bool,
}

/// One waiter that has been queued for longer than the long-wait threshold.
#[derive(Debug, Clone)]
pub struct LongWait {
    /// Resource being waited on
    pub resource: String,
    /// Which lock kind the waiter queued for
    pub kind: LockKind,
    /// How long the waiter has been queued
    pub waited: Duration,
}

struct ResourceEntry {
    rw: FairRwLock,
    process: ProcessLock,
    process_stats: Arc<StatsCell>,
}

/// Registry mapping resource names to locks, with per-resource statistics
/// and deadlock-heuristic long-wait reporting.
pub struct LockManager {
    lock_dir: PathBuf,
    config: LockConfig,
    resources: RwLock<HashMap<String, Arc<ResourceEntry>>>,
    process_waits: Arc<Mutex<HashMap<u64, (String, Instant)>>>,
    next_wait_id: Mutex<u64>,
}

impl LockManager {
    /// Create a manager storing its lock files under `lock_dir`.
    #[must_use]
    pub fn new(lock_dir: &Path, config: LockConfig) -> Arc<Self> {
        Arc::new(Self {
            lock_dir: lock_dir.to_path_buf(),
            config,
            resources: RwLock::new(HashMap::new()),
            process_waits: Arc::new(Mutex::new(HashMap::new())),
            next_wait_id: Mutex::new(0),
        })
    }

    /// Lock timeouts this manager was configured with.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn entry(&self, resource: &str) -> Arc<ResourceEntry> {
        if let Some(entry) = self.resources.read().get(resource) {
            return Arc::clone(entry);
        }
        let mut resources = self.resources.write();
        Arc::clone(resources.entry(resource.to_string()).or_insert_with(|| {
            debug!(resource, "registering lock resource");
            Arc::new(ResourceEntry {
                rw: FairRwLock::new(resource),
                process: ProcessLock::new(
                    &self.lock_dir,
                    resource,
                    self.config.process_lock_stale_after,
                ),
                process_stats: Arc::new(StatsCell::default()),
            })
        }))
    }

    /// Acquire a read lock on `resource` with the default read timeout.
    pub async fn read_lock(&self, resource: &str) -> Result<RwReadGuard> {
        self.read_lock_timeout(resource, self.config.read_timeout)
            .await
    }

    /// Acquire a read lock on `resource` with an explicit deadline.
    pub async fn read_lock_timeout(&self, resource: &str, timeout: Duration) -> Result<RwReadGuard> {
        self.entry(resource).rw.read(timeout).await
    }

    /// Acquire a write lock on `resource` with the default write timeout.
    pub async fn write_lock(&self, resource: &str) -> Result<RwWriteGuard> {
        self.write_lock_timeout(resource, self.config.write_timeout)
            .await
    }

    /// Acquire a write lock on `resource` with an explicit deadline.
    pub async fn write_lock_timeout(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<RwWriteGuard> {
        self.entry(resource).rw.write(timeout).await
    }

    /// Acquire the cross-process lock on `resource` with the default timeout.
    pub async fn process_lock(&self, resource: &str) -> Result<ManagedProcessGuard> {
        self.process_lock_timeout(resource, self.config.process_lock_timeout)
            .await
    }

    /// Acquire the cross-process lock on `resource` with an explicit deadline.
    pub async fn process_lock_timeout(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<ManagedProcessGuard> {
        let entry = self.entry(resource);
        let started = Instant::now();

        let wait_token = self.track_wait(resource);
        entry.process_stats.on_enqueue();
        let acquired = entry.process.acquire(timeout).await;
        entry.process_stats.on_dequeue();
        drop(wait_token);

        match acquired {
            Ok(guard) => {
                entry.process_stats.on_acquire(started.elapsed());
                Ok(ManagedProcessGuard {
                    _guard: guard,
                    stats: Arc::clone(&entry.process_stats),
                    acquired_at: Instant::now(),
                })
            }
            Err(e) => {
                if matches!(e, crate::error::Error::Timeout { .. }) {
                    entry.process_stats.on_timeout();
                } else {
                    entry.process_stats.on_error();
                }
                Err(e)
            }
        }
    }

    fn track_wait(&self, resource: &str) -> WaitToken {
        let id = {
            let mut next = self.next_wait_id.lock();
            *next += 1;
            *next
        };
        self.process_waits
            .lock()
            .insert(id, (resource.to_string(), Instant::now()));
        WaitToken {
            id,
            waits: Arc::clone(&self.process_waits),
        }
    }

    /// Statistics for one resource, or zeroed stats for an unknown name.
    #[must_use]
    pub fn stats(&self, resource: &str) -> ResourceLockStats {
        self.resources
            .read()
            .get(resource)
            .map(|entry| ResourceLockStats {
                read: entry.rw.stats(LockKind::Read),
                write: entry.rw.stats(LockKind::Write),
                process: entry.process_stats.snapshot(),
            })
            .unwrap_or_default()
    }

    /// Statistics for every registered resource.
    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, ResourceLockStats> {
        self.resources
            .read()
            .keys()
            .map(|resource| (resource.clone(), self.stats(resource)))
            .collect()
    }

    /// Holders/waiters snapshot for one resource.
    #[must_use]
    pub fn status(&self, resource: &str) -> ResourceLockStatus {
        self.resources
            .read()
            .get(resource)
            .map(|entry| ResourceLockStatus {
                rw: entry.rw.status(),
                process_held: entry.process_stats.snapshot().current_holders > 0,
            })
            .unwrap_or_default()
    }

    /// Holders/waiters snapshot for every registered resource.
    #[must_use]
    pub fn all_status(&self) -> HashMap<String, ResourceLockStatus> {
        self.resources
            .read()
            .keys()
            .map(|resource| (resource.clone(), self.status(resource)))
            .collect()
    }

    /// Waiters queued longer than the configured long-wait threshold.
    ///
    /// This is a reporting heuristic only; nothing is aborted.
    #[must_use]
    pub fn detect_long_waits(&self) -> Vec<LongWait> {
        let threshold = self.config.long_wait_threshold;
        let mut out = Vec::new();
        for (resource, entry) in self.resources.read().iter() {
            for (kind, waited) in entry.rw.waits_longer_than(threshold) {
                out.push(LongWait {
                    resource: resource.clone(),
                    kind,
                    waited,
                });
            }
        }
        for (resource, since) in self.process_waits.lock().values() {
            let waited = since.elapsed();
            if waited > threshold {
                out.push(LongWait {
                    resource: resource.clone(),
                    kind: LockKind::Process,
                    waited,
                });
            }
        }
        out.sort_by(|a, b| b.waited.cmp(&a.waited));
        out
    }
}

struct WaitToken {
    id: u64,
    waits: Arc<Mutex<HashMap<u64, (String, Instant)>>>,
}

impl Drop for WaitToken {
    fn drop(&mut self) {
        self.waits.lock().remove(&self.id);
    }
}

/// Process-lock guard that records hold time on release.
pub struct ManagedProcessGuard {
    _guard: ProcessLockGuard,
    stats: Arc<StatsCell>,
    acquired_at: Instant,
}

impl Drop for ManagedProcessGuard {
    fn drop(&mut self) {
        self.stats.on_release(self.acquired_at.elapsed());
    }
}
