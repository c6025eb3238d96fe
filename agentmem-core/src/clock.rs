//! Injected clock so time-dependent behavior is deterministic in tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Wall-clock and monotonic time provider.
///
/// Everything in the substrate that reads time (recency scoring, TTL expiry,
/// stale-lock detection, decay passes) goes through this trait so tests can
/// install a [`ManualClock`] and step time explicitly.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic elapsed time since an arbitrary fixed origin.
    fn monotonic(&self) -> Duration;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Real system clock.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a system clock with its monotonic origin at construction time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Shared handle to a fresh system clock.
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually stepped clock for deterministic tests.
///
/// Both the wall clock and the monotonic reading advance together via
/// [`ManualClock::advance`].
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    elapsed: Duration,
}

impl ManualClock {
    /// Create a manual clock starting at the given wall-clock instant.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now,
                elapsed: Duration::ZERO,
            }),
        }
    }

    /// Shared handle starting at the current wall-clock time.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::starting_at(Utc::now()))
    }

    /// Advance both clocks by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut state = self.state.lock();
        state.now += chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::zero());
        state.elapsed += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn monotonic(&self) -> Duration {
        self.state.lock().elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_readings() {
        let start = Utc::now();
        let clock = ManualClock::starting_at(start);
        assert_eq!(clock.monotonic(), Duration::ZERO);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.monotonic(), Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn test_system_clock_monotonic_is_nondecreasing() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }
}
