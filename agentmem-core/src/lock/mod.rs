//! Concurrent locking: fair RW locks, cross-process file locks, and the
//! per-runtime lock registry with statistics and long-wait detection.

mod manager;
mod process;
mod rw;
mod stats;

pub use manager::{
    LockManager, LongWait, ManagedProcessGuard, ResourceLockStats, ResourceLockStatus,
};
pub use process::{ProcessLock, ProcessLockGuard, platform_supports_true_cross_process_lock};
pub use rw::{FairRwLock, RwLockStatus, RwReadGuard, RwWriteGuard};
pub use stats::{DurationStats, KindStats, LockKind};
