//! Advisory cross-process lock backed by a create-exclusive lock file.
//!
//! A lock is a well-known file under the lock directory holding the owner's
//! pid and acquisition timestamp. Acquisition retries with jittered
//! exponential backoff until the deadline. Lock files older than the
//! configured staleness threshold whose owner is gone are reclaimed.
//!
//! Within a process, acquisition is additionally serialized by an in-process
//! mutex so two tasks in the same process never race on the same file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Whether this platform can verify that a lock owner process is still alive.
///
/// Where it cannot, staleness falls back to an age-only heuristic: a lock past
/// the staleness threshold is reclaimed without a liveness probe.
#[must_use]
pub fn platform_supports_true_cross_process_lock() -> bool {
    cfg!(target_os = "linux")
}

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

struct ProcessInner {
    resource: String,
    path: PathBuf,
    stale_after: Duration,
    local: Arc<tokio::sync::Mutex<()>>,
}

/// One cross-process lock file. Cloning yields another handle to the same
/// lock.
#[derive(Clone)]
pub struct ProcessLock {
    inner: Arc<ProcessInner>,
}

impl ProcessLock {
    /// Create a handle for `resource` under `lock_dir`.
    ///
    /// The lock directory is created on first use.
    #[must_use]
    pub fn new(lock_dir: &Path, resource: impl Into<String>, stale_after: Duration) -> Self {
        let resource = resource.into();
        let file_name = format!("{}.lock", sanitize(&resource));
        Self {
            inner: Arc::new(ProcessInner {
                path: lock_dir.join(file_name),
                resource,
                stale_after,
                local: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// Resource name this lock guards.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Acquire the lock, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the deadline expires, [`Error::LockStale`]
    /// when a stale lock was detected but could not be reclaimed.
    pub async fn acquire(&self, timeout: Duration) -> Result<ProcessLockGuard> {
        let started = Instant::now();

        // Serialize same-process acquisitions first; the file protocol below
        // then only ever races with other processes.
        let local = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.local).lock_owned(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => {
                return Err(Error::timeout(
                    format!("process lock on {}", self.inner.resource),
                    started.elapsed(),
                ));
            }
        };

        let mut backoff = Duration::from_millis(10);
        loop {
            match self.try_create_lock_file() {
                Ok(()) => {
                    debug!(
                        resource = %self.inner.resource,
                        path = %self.inner.path.display(),
                        "acquired process lock"
                    );
                    return Ok(ProcessLockGuard {
                        lock: self.clone(),
                        _local: local,
                    });
                }
                Err(Error::Storage(_)) => {
                    // Held by someone; fall through to staleness check + retry.
                }
                Err(other) => return Err(other),
            }

            if let Some(owner) = self.read_owner() {
                let age = Utc::now().signed_duration_since(owner.acquired_at);
                let stale = age
                    .to_std()
                    .is_ok_and(|age| age > self.inner.stale_after);
                if stale && !owner_alive(owner.pid) {
                    warn!(
                        resource = %self.inner.resource,
                        owner_pid = owner.pid,
                        age_secs = age.num_seconds(),
                        "reclaiming stale process lock"
                    );
                    if std::fs::remove_file(&self.inner.path).is_err() && self.inner.path.exists() {
                        return Err(Error::LockStale {
                            resource: self.inner.resource.clone(),
                        });
                    }
                    continue;
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::timeout(
                    format!("process lock on {}", self.inner.resource),
                    waited,
                ));
            }

            let jittered = jitter(backoff).min(timeout - waited);
            tokio::time::sleep(jittered).await;
            backoff = (backoff * 2).min(Duration::from_millis(500));
        }
    }

    fn try_create_lock_file(&self) -> Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.inner.path)
        {
            Ok(file) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                };
                serde_json::to_writer(&file, &owner)?;
                file.sync_all()?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::Storage("lock file exists".to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn read_owner(&self) -> Option<LockOwner> {
        let bytes = std::fs::read(&self.inner.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn release(&self) {
        if let Err(e) = std::fs::remove_file(&self.inner.path) {
            if self.inner.path.exists() {
                warn!(
                    resource = %self.inner.resource,
                    error = %e,
                    "failed to remove process lock file"
                );
            }
        }
    }
}

/// Guard for a held process lock; removes the lock file on drop.
pub struct ProcessLockGuard {
    lock: ProcessLock,
    _local: tokio::sync::OwnedMutexGuard<()>,
}

impl std::fmt::Debug for ProcessLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLockGuard").finish()
    }
}

impl Drop for ProcessLockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

fn sanitize(resource: &str) -> String {
    resource
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1);
    let base_ms = u64::try_from(base_ms).unwrap_or(u64::MAX);
    let spread = (base_ms / 2).max(1);
    let offset = rand::rng().random_range(0..=spread);
    Duration::from_millis(base_ms / 2 + offset)
}

#[cfg(target_os = "linux")]
fn owner_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn owner_alive(_pid: u32) -> bool {
    // No portable liveness probe; age-based staleness alone decides.
    false
}
