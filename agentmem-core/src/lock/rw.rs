//! Coroutine-safe multi-reader / single-writer lock with FIFO writer fairness.
//!
//! Readers are admitted only while no writer is active and no writer is
//! queued, so a steady stream of readers cannot starve writers. Writers are
//! granted strictly in enqueue order. Every acquisition carries a deadline;
//! a timed-out or cancelled waiter removes itself from the queue atomically
//! and is never woken afterwards.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::stats::{KindStats, LockKind, StatsCell};
use crate::error::{Error, Result};

#[derive(Debug)]
struct WaiterShared {
    notify: Notify,
    // Written only under the lock state mutex; the atomic is for cheap reads.
    granted: AtomicBool,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    enqueued_at: Instant,
    shared: Arc<WaiterShared>,
}

#[derive(Debug, Default)]
struct RwState {
    active_readers: usize,
    writer_active: bool,
    reader_queue: VecDeque<Waiter>,
    writer_queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// Point-in-time view of one RW lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RwLockStatus {
    /// Readers currently holding the lock
    pub active_readers: usize,
    /// Whether a writer currently holds the lock
    pub writer_active: bool,
    /// Readers waiting for admission
    pub queued_readers: usize,
    /// Writers waiting for exclusivity
    pub queued_writers: usize,
}

struct RwInner {
    resource: String,
    state: Mutex<RwState>,
    read_stats: StatsCell,
    write_stats: StatsCell,
}

/// FIFO-fair async read/write lock for one named resource.
///
/// Cloning is cheap and yields another handle to the same lock; guards keep
/// the lock alive for as long as they are held.
#[derive(Clone)]
pub struct FairRwLock {
    inner: Arc<RwInner>,
}

impl FairRwLock {
    /// Create an unlocked instance for the given resource name.
    #[must_use]
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwInner {
                resource: resource.into(),
                state: Mutex::new(RwState::default()),
                read_stats: StatsCell::default(),
                write_stats: StatsCell::default(),
            }),
        }
    }

    /// Resource name this lock guards.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Acquire a shared guard, waiting at most `timeout`.
    pub async fn read(&self, timeout: Duration) -> Result<RwReadGuard> {
        let started = Instant::now();
        let handle = {
            let mut state = self.inner.state.lock();
            if !state.writer_active && state.writer_queue.is_empty() {
                state.active_readers += 1;
                self.inner.read_stats.on_acquire(started.elapsed());
                return Ok(RwReadGuard {
                    lock: self.clone(),
                    acquired_at: Instant::now(),
                });
            }
            self.enqueue_locked(&mut state, LockKind::Read, started)
        };
        self.await_grant(handle, LockKind::Read, started, timeout)
            .await?;
        Ok(RwReadGuard {
            lock: self.clone(),
            acquired_at: Instant::now(),
        })
    }

    /// Acquire the exclusive guard, waiting at most `timeout`.
    pub async fn write(&self, timeout: Duration) -> Result<RwWriteGuard> {
        let started = Instant::now();
        let handle = {
            let mut state = self.inner.state.lock();
            if !state.writer_active && state.active_readers == 0 && state.writer_queue.is_empty() {
                state.writer_active = true;
                self.inner.write_stats.on_acquire(started.elapsed());
                return Ok(RwWriteGuard {
                    lock: self.clone(),
                    acquired_at: Instant::now(),
                });
            }
            self.enqueue_locked(&mut state, LockKind::Write, started)
        };
        self.await_grant(handle, LockKind::Write, started, timeout)
            .await?;
        Ok(RwWriteGuard {
            lock: self.clone(),
            acquired_at: Instant::now(),
        })
    }

    /// Statistics snapshot for one side of the lock.
    #[must_use]
    pub fn stats(&self, kind: LockKind) -> KindStats {
        self.stats_for(kind).snapshot()
    }

    /// Current holders and waiters.
    #[must_use]
    pub fn status(&self) -> RwLockStatus {
        let state = self.inner.state.lock();
        RwLockStatus {
            active_readers: state.active_readers,
            writer_active: state.writer_active,
            queued_readers: state.reader_queue.len(),
            queued_writers: state.writer_queue.len(),
        }
    }

    /// Wait durations of queued waiters that exceed `threshold`.
    #[must_use]
    pub fn waits_longer_than(&self, threshold: Duration) -> Vec<(LockKind, Duration)> {
        let state = self.inner.state.lock();
        let mut out = Vec::new();
        for waiter in &state.reader_queue {
            let waited = waiter.enqueued_at.elapsed();
            if waited > threshold {
                out.push((LockKind::Read, waited));
            }
        }
        for waiter in &state.writer_queue {
            let waited = waiter.enqueued_at.elapsed();
            if waited > threshold {
                out.push((LockKind::Write, waited));
            }
        }
        out
    }

    fn enqueue_locked(
        &self,
        state: &mut RwState,
        kind: LockKind,
        enqueued_at: Instant,
    ) -> WaitHandle {
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        let shared = Arc::new(WaiterShared {
            notify: Notify::new(),
            granted: AtomicBool::new(false),
        });
        let waiter = Waiter {
            id,
            enqueued_at,
            shared: Arc::clone(&shared),
        };
        match kind {
            LockKind::Read => state.reader_queue.push_back(waiter),
            LockKind::Write | LockKind::Process => state.writer_queue.push_back(waiter),
        }
        self.stats_for(kind).on_enqueue();
        WaitHandle {
            lock: self.clone(),
            id,
            kind,
            shared,
            settled: false,
        }
    }

    async fn await_grant(
        &self,
        mut handle: WaitHandle,
        kind: LockKind,
        started: Instant,
        timeout: Duration,
    ) -> Result<()> {
        let shared = Arc::clone(&handle.shared);
        let notified = async move { shared.notify.notified().await };
        match tokio::time::timeout(timeout, notified).await {
            Ok(()) => {
                handle.settled = true;
                self.stats_for(kind).on_dequeue();
                self.stats_for(kind).on_acquire(started.elapsed());
                Ok(())
            }
            Err(_elapsed) => {
                // The drop of `handle` removes us from the queue, or hands the
                // just-granted lock back, atomically under the state mutex.
                drop(handle);
                self.stats_for(kind).on_timeout();
                trace!(
                    resource = %self.inner.resource,
                    kind = %kind,
                    "lock wait timed out"
                );
                Err(Error::timeout(
                    format!("{kind} lock on {}", self.inner.resource),
                    started.elapsed(),
                ))
            }
        }
    }

    fn stats_for(&self, kind: LockKind) -> &StatsCell {
        match kind {
            LockKind::Read => &self.inner.read_stats,
            LockKind::Write | LockKind::Process => &self.inner.write_stats,
        }
    }

    fn release_read(&self) {
        let mut state = self.inner.state.lock();
        state.active_readers = state.active_readers.saturating_sub(1);
        if state.active_readers == 0 && !state.writer_active {
            Self::wake_next_locked(&mut state);
        }
    }

    fn release_write(&self) {
        let mut state = self.inner.state.lock();
        state.writer_active = false;
        if state.active_readers == 0 {
            Self::wake_next_locked(&mut state);
        }
    }

    // Grants the head writer, or admits every queued reader when no writer
    // is pending. Callers must have established idle state.
    fn wake_next_locked(state: &mut RwState) {
        debug_assert!(!state.writer_active && state.active_readers == 0);
        if let Some(writer) = state.writer_queue.pop_front() {
            state.writer_active = true;
            writer.shared.granted.store(true, Ordering::Release);
            writer.shared.notify.notify_one();
            return;
        }
        while let Some(reader) = state.reader_queue.pop_front() {
            state.active_readers += 1;
            reader.shared.granted.store(true, Ordering::Release);
            reader.shared.notify.notify_one();
        }
    }
}

// Queue membership guard: on timeout or caller cancellation the waiter must
// disappear from the lock atomically, returning a racing grant if one landed.
struct WaitHandle {
    lock: FairRwLock,
    id: u64,
    kind: LockKind,
    shared: Arc<WaiterShared>,
    settled: bool,
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.lock.inner.state.lock();
        if self.shared.granted.load(Ordering::Acquire) {
            // Granted between timeout expiry and cleanup: hand it straight back.
            match self.kind {
                LockKind::Read => {
                    state.active_readers = state.active_readers.saturating_sub(1);
                    if state.active_readers == 0 && !state.writer_active {
                        FairRwLock::wake_next_locked(&mut state);
                    }
                }
                LockKind::Write | LockKind::Process => {
                    state.writer_active = false;
                    if state.active_readers == 0 {
                        FairRwLock::wake_next_locked(&mut state);
                    }
                }
            }
        } else {
            let queue = match self.kind {
                LockKind::Read => &mut state.reader_queue,
                LockKind::Write | LockKind::Process => &mut state.writer_queue,
            };
            queue.retain(|w| w.id != self.id);
        }
        drop(state);
        self.lock.stats_for(self.kind).on_dequeue();
    }
}

/// Shared guard; releases on drop, including panic and cancellation paths.
pub struct RwReadGuard {
    lock: FairRwLock,
    acquired_at: Instant,
}

impl std::fmt::Debug for RwReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwReadGuard")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

impl Drop for RwReadGuard {
    fn drop(&mut self) {
        self.lock.release_read();
        self.lock
            .inner
            .read_stats
            .on_release(self.acquired_at.elapsed());
    }
}

/// Exclusive guard; releases on drop, including panic and cancellation paths.
pub struct RwWriteGuard {
    lock: FairRwLock,
    acquired_at: Instant,
}

impl std::fmt::Debug for RwWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwWriteGuard")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

impl Drop for RwWriteGuard {
    fn drop(&mut self) {
        self.lock.release_write();
        self.lock
            .inner
            .write_stats
            .on_release(self.acquired_at.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[tokio::test]
    async fn test_concurrent_readers_share() {
        let lock = FairRwLock::new("shared");
        let g1 = lock.read(Duration::from_secs(1)).await.unwrap();
        let g2 = lock.read(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lock.status().active_readers, 2);
        drop(g1);
        drop(g2);
        assert_eq!(lock.status().active_readers, 0);
    }

    #[tokio::test]
    async fn test_writer_excludes_readers() {
        let lock = FairRwLock::new("exclusive");
        let guard = lock.write(Duration::from_secs(1)).await.unwrap();
        let err = lock.read(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        drop(guard);
        assert!(lock.read(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_queued_writer_blocks_new_readers() {
        let lock = FairRwLock::new("fairness");
        let reader = lock.read(Duration::from_secs(1)).await.unwrap();

        let lock_w = lock.clone();
        let writer_task =
            tokio::spawn(async move { lock_w.write(Duration::from_secs(5)).await.map(drop) });
        // Give the writer time to enqueue behind the active reader.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock.status().queued_writers, 1);

        // A reader arriving after the writer must wait behind it.
        let late_reader = lock.read(Duration::from_millis(50)).await;
        assert!(late_reader.is_err());

        drop(reader);
        writer_task.await.unwrap().unwrap();
        assert!(lock.read(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_writers_granted_in_fifo_order() {
        let lock = FairRwLock::new("fifo");
        let order = Arc::new(Mutex::new(Vec::new()));
        let first_writer = lock.write(Duration::from_secs(1)).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..4u32 {
            let lock = lock.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let guard = lock.write(Duration::from_secs(5)).await.unwrap();
                order.lock().push(i);
                drop(guard);
            }));
            // Serialize enqueue order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(first_writer);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_no_reader_writer_overlap() {
        let lock = FairRwLock::new("overlap");
        let in_critical = Arc::new(AtomicUsize::new(0));
        let writers_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..24u32 {
            let lock = lock.clone();
            let in_critical = Arc::clone(&in_critical);
            let writers_seen = Arc::clone(&writers_seen);
            tasks.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    let _g = lock.write(Duration::from_secs(10)).await.unwrap();
                    let was = in_critical.fetch_add(1, AtomicOrdering::SeqCst);
                    assert_eq!(was, 0, "writer overlapped with another holder");
                    tokio::task::yield_now().await;
                    in_critical.fetch_sub(1, AtomicOrdering::SeqCst);
                    writers_seen.fetch_add(1, AtomicOrdering::SeqCst);
                } else {
                    let _g = lock.read(Duration::from_secs(10)).await.unwrap();
                    in_critical.fetch_add(1, AtomicOrdering::SeqCst);
                    tokio::task::yield_now().await;
                    in_critical.fetch_sub(1, AtomicOrdering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(writers_seen.load(AtomicOrdering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_timed_out_waiter_leaves_queue() {
        let lock = FairRwLock::new("timeout-cleanup");
        let guard = lock.write(Duration::from_secs(1)).await.unwrap();

        let err = lock.write(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(lock.status().queued_writers, 0);
        assert_eq!(lock.stats(LockKind::Write).timeouts, 1);

        // Release must not wake the departed waiter; lock goes idle.
        drop(guard);
        assert!(!lock.status().writer_active);
        assert!(lock.write(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_write_drains_reader_queue() {
        let lock = FairRwLock::new("drain");
        let writer = lock.write(Duration::from_secs(1)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let lock = lock.clone();
            tasks.push(tokio::spawn(async move {
                let _g = lock.read(Duration::from_secs(5)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock.status().queued_readers, 3);

        drop(writer);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(lock.status().active_readers, 0);
    }

    #[tokio::test]
    async fn test_stats_track_wait_and_hold() {
        let lock = FairRwLock::new("stats");
        {
            let _g = lock.write(Duration::from_secs(1)).await.unwrap();
        }
        let stats = lock.stats(LockKind::Write);
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.current_holders, 0);
        assert!(stats.hold.samples >= 1);
    }
}
