//! Per-document mutual exclusion across the process pool.
//!
//! Two layers cooperate:
//!
//! ```text
//! with_lock(key)
//!       │
//!       ├─► LockQueue: local FIFO, one runner per key in this process
//!       │
//!       └─► DistributedLock: set-if-absent on the shared store, polled
//!               │
//!               └─► critical section, then compare-and-delete release
//! ```
//!
//! The queue keeps same-process callers from hammering the shared store
//! while one of them already holds (or is polling for) the lock.

mod backoff;
mod distributed;
mod manager;
mod queue;

pub use backoff::PollBackoff;
pub use distributed::{DistributedLock, LockGuard};
pub use manager::LockManager;
pub use queue::{LockQueue, LockTicket};

use std::time::Duration;

use crate::config::defaults;

/// Timings used when acquiring a distributed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Expiry written with the lock; a crashed holder frees it after this long
    pub lease: Duration,
    /// Total time an acquire may spend waiting
    pub max_wait: Duration,
    /// First polling interval
    pub poll_min: Duration,
    /// Polling interval cap
    pub poll_max: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_millis(defaults::DEFAULT_LOCK_LEASE_MS),
            max_wait: Duration::from_millis(defaults::DEFAULT_LOCK_MAX_WAIT_MS),
            poll_min: Duration::from_millis(defaults::DEFAULT_LOCK_POLL_MIN_MS),
            poll_max: Duration::from_millis(defaults::DEFAULT_LOCK_POLL_MAX_MS),
        }
    }
}
