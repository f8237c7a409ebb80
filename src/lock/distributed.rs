//! Lock held in the shared store.
//!
//! Acquisition writes a fresh ULID token with an expiry using set-if-absent;
//! release deletes the key only while it still holds that token, so a holder
//! whose lease ran out can never free somebody else's lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use ulid::Ulid;

use super::{LockOptions, PollBackoff};
use crate::error::{SyncError, SyncResult};
use crate::store::SharedStore;

const LOG_TARGET: &str = "collab_sync::lock";

/// Proof of holding a distributed lock.
///
/// Consumed by [`DistributedLock::release`]. Dropping a guard without
/// releasing leaves the key to expire with its lease.
#[derive(Debug)]
#[must_use = "a lock that is never released stays held until its lease expires"]
pub struct LockGuard {
    key: String,
    token: String,
    acquired_at: Instant,
    lease: Duration,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Whether the lease has run out, i.e. another process may hold the key now.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease
    }
}

pub struct DistributedLock<S> {
    store: Arc<S>,
    options: LockOptions,
}

impl<S> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            options: self.options,
        }
    }
}

impl<S: SharedStore> DistributedLock<S> {
    pub fn new(store: Arc<S>, options: LockOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire `key`, polling until `max_wait` has elapsed.
    ///
    /// At least one attempt is made even with a zero `max_wait`.
    pub async fn acquire(
        &self,
        key: &str,
        max_wait: Duration,
        lease: Duration,
    ) -> SyncResult<LockGuard> {
        let token = Ulid::new().to_string();
        let started = Instant::now();
        let mut backoff = PollBackoff::new(self.options.poll_min, self.options.poll_max);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(guard) = self.attempt(key, &token, lease).await? {
                log::trace!(
                    target: LOG_TARGET,
                    "Acquired {} after {} attempt(s) in {:?}",
                    key,
                    attempts,
                    started.elapsed()
                );
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                log::warn!(
                    target: LOG_TARGET,
                    "Timed out waiting for {} after {:?} ({} attempts)",
                    key,
                    waited,
                    attempts
                );
                return Err(SyncError::lock_timeout(key, waited));
            }

            let delay = backoff.next_delay().min(max_wait - waited);
            tokio::time::sleep(delay).await;
        }
    }

    /// Single acquisition attempt. `Ok(None)` means somebody else holds `key`.
    pub async fn try_acquire(&self, key: &str, lease: Duration) -> SyncResult<Option<LockGuard>> {
        let token = Ulid::new().to_string();
        self.attempt(key, &token, lease).await
    }

    async fn attempt(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> SyncResult<Option<LockGuard>> {
        let created = self
            .store
            .set_if_absent(key, token, lease)
            .await
            .map_err(|e| SyncError::lock_store_unavailable(key, e))?;

        Ok(created.then(|| LockGuard {
            key: key.to_string(),
            token: token.to_string(),
            acquired_at: Instant::now(),
            lease,
        }))
    }

    /// Release a held lock.
    ///
    /// Returns `false` when the key no longer holds this guard's token (the
    /// lease expired and someone else took over) or the store failed; neither
    /// case is an error for the caller.
    pub async fn release(&self, guard: LockGuard) -> bool {
        let held_for = guard.acquired_at.elapsed();
        if held_for > guard.lease {
            log::warn!(
                target: LOG_TARGET,
                "Lock {} was held for {:?}, longer than its {:?} lease",
                guard.key,
                held_for,
                guard.lease
            );
        }

        match self.store.compare_and_delete(&guard.key, &guard.token).await {
            Ok(true) => {
                log::trace!(target: LOG_TARGET, "Released {}", guard.key);
                true
            }
            Ok(false) => {
                log::debug!(
                    target: LOG_TARGET,
                    "Lock {} no longer holds token {}; release skipped",
                    guard.key,
                    guard.token
                );
                false
            }
            Err(e) => {
                log::error!(
                    target: LOG_TARGET,
                    "Failed to release {}: {}; it will expire with its lease",
                    guard.key,
                    e
                );
                false
            }
        }
    }
}
