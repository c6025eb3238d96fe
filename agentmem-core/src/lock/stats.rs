//! Per-resource lock statistics.

use std::time::Duration;

use parking_lot::Mutex;

/// Which primitive a statistic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Shared side of the RW lock
    Read,
    /// Exclusive side of the RW lock
    Write,
    /// Cross-process file lock
    Process,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::Read => write!(f, "read"),
            LockKind::Write => write!(f, "write"),
            LockKind::Process => write!(f, "process"),
        }
    }
}

/// Running min/max/avg over durations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurationStats {
    /// Number of samples folded in
    pub samples: u64,
    /// Smallest observed duration
    pub min: Option<Duration>,
    /// Largest observed duration
    pub max: Option<Duration>,
    /// Sum of all samples, for averaging
    pub total: Duration,
}

impl DurationStats {
    fn record(&mut self, sample: Duration) {
        self.samples += 1;
        self.total += sample;
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = Some(self.max.map_or(sample, |m| m.max(sample)));
    }

    /// Mean of the recorded samples, zero when empty.
    #[must_use]
    pub fn avg(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            self.total / u32::try_from(self.samples).unwrap_or(u32::MAX)
        }
    }
}

/// Counters for one (resource, kind) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindStats {
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Releases (every acquisition eventually releases)
    pub releases: u64,
    /// Acquisition attempts that hit their deadline
    pub timeouts: u64,
    /// Acquisition attempts that failed for any other reason
    pub errors: u64,
    /// Time spent waiting before each grant
    pub wait: DurationStats,
    /// Time each holder kept the lock
    pub hold: DurationStats,
    /// Holders right now
    pub current_holders: usize,
    /// Waiters queued right now
    pub current_waiters: usize,
}

/// Shared mutable statistics cell for one (resource, kind).
#[derive(Debug, Default)]
pub struct StatsCell {
    inner: Mutex<KindStats>,
}

impl StatsCell {
    pub(crate) fn on_enqueue(&self) {
        self.inner.lock().current_waiters += 1;
    }

    pub(crate) fn on_dequeue(&self) {
        let mut stats = self.inner.lock();
        stats.current_waiters = stats.current_waiters.saturating_sub(1);
    }

    pub(crate) fn on_acquire(&self, waited: Duration) {
        let mut stats = self.inner.lock();
        stats.acquisitions += 1;
        stats.current_holders += 1;
        stats.wait.record(waited);
    }

    pub(crate) fn on_release(&self, held: Duration) {
        let mut stats = self.inner.lock();
        stats.releases += 1;
        stats.current_holders = stats.current_holders.saturating_sub(1);
        stats.hold.record(held);
    }

    pub(crate) fn on_timeout(&self) {
        self.inner.lock().timeouts += 1;
    }

    pub(crate) fn on_error(&self) {
        self.inner.lock().errors += 1;
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn snapshot(&self) -> KindStats {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_stats_min_max_avg() {
        let mut stats = DurationStats::default();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        assert_eq!(stats.min, Some(Duration::from_millis(10)));
        assert_eq!(stats.max, Some(Duration::from_millis(30)));
        assert_eq!(stats.avg(), Duration::from_millis(20));
    }

    #[test]
    fn test_cell_gauges_track_holders_and_waiters() {
        let cell = StatsCell::default();
        cell.on_enqueue();
        cell.on_enqueue();
        cell.on_dequeue();
        cell.on_acquire(Duration::from_millis(5));
        let stats = cell.snapshot();
        assert_eq!(stats.current_waiters, 1);
        assert_eq!(stats.current_holders, 1);
        assert_eq!(stats.acquisitions, 1);

        cell.on_release(Duration::from_millis(50));
        assert_eq!(cell.snapshot().current_holders, 0);
        assert_eq!(cell.snapshot().releases, 1);
    }
}
