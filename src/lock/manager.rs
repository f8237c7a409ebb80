use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use super::{DistributedLock, LockOptions, LockQueue};
use crate::error::{SyncError, SyncResult};
use crate::store::SharedStore;

const LOG_TARGET: &str = "collab_sync::lock";

/// Runs critical sections under both the local queue and the distributed lock.
///
/// Every runner acquires the distributed lock afresh; a ticket handed over
/// by the local queue never carries the previous runner's lock with it.
pub struct LockManager<S> {
    lock: DistributedLock<S>,
    queue: LockQueue,
}

impl<S: SharedStore> LockManager<S> {
    pub fn new(store: Arc<S>, options: LockOptions) -> Self {
        Self {
            lock: DistributedLock::new(store, options),
            queue: LockQueue::new(),
        }
    }

    pub fn options(&self) -> &LockOptions {
        self.lock.options()
    }

    pub fn queue(&self) -> &LockQueue {
        &self.queue
    }

    /// Run `f` while holding `key`, waiting up to the configured `max_wait`.
    ///
    /// Time spent in the local queue counts against `max_wait`. The lock is
    /// released whether `f` succeeds or fails.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let options = *self.lock.options();
        let started = Instant::now();

        let ticket = match tokio::time::timeout(options.max_wait, self.queue.enqueue(key)).await {
            Ok(ticket) => ticket,
            Err(_) => {
                let waited = started.elapsed();
                log::warn!(
                    target: LOG_TARGET,
                    "Timed out in the local queue for {} after {:?}",
                    key,
                    waited
                );
                return Err(SyncError::lock_timeout(key, waited));
            }
        };

        let remaining = options.max_wait.saturating_sub(started.elapsed());
        let guard = self.lock.acquire(key, remaining, options.lease).await?;

        let result = f().await;

        self.lock.release(guard).await;
        drop(ticket);
        result
    }

    /// Run `f` only if `key` is free right now, locally and across processes.
    ///
    /// Returns `Ok(None)` without running `f` when the key is busy.
    pub async fn try_with_lock<F, Fut, T>(&self, key: &str, f: F) -> SyncResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let Some(ticket) = self.queue.try_enqueue(key) else {
            log::trace!(target: LOG_TARGET, "{} is busy in this process", key);
            return Ok(None);
        };
        let Some(guard) = self.lock.try_acquire(key, self.lock.options().lease).await? else {
            log::trace!(target: LOG_TARGET, "{} is held by another process", key);
            return Ok(None);
        };

        let result = f().await;

        self.lock.release(guard).await;
        drop(ticket);
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager(store: Arc<MemoryStore>) -> Arc<LockManager<MemoryStore>> {
        Arc::new(LockManager::new(store, LockOptions::default()))
    }

    #[tokio::test]
    async fn critical_sections_never_overlap() {
        let store = Arc::new(MemoryStore::new());
        // Two managers sharing a store behave like two processes.
        let managers = [manager(store.clone()), manager(store.clone())];
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = managers[i % 2].clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .with_lock("Blocking:doc", || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("Blocking:doc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lock_is_released_when_the_section_fails() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());

        let result: SyncResult<()> = manager
            .with_lock("Blocking:doc", || async {
                Err(SyncError::malformed("doc", "boom"))
            })
            .await;

        assert!(matches!(result, Err(SyncError::MalformedOperation { .. })));
        assert_eq!(store.get("Blocking:doc").await.unwrap(), None);
        assert_eq!(manager.queue().active_keys(), 0);
    }

    #[tokio::test]
    async fn try_with_lock_skips_busy_keys() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());
        store
            .set_if_absent("Blocking:doc", "someone-else", Duration::from_secs(30))
            .await
            .unwrap();

        let ran = manager
            .try_with_lock("Blocking:doc", || async { Ok(()) })
            .await
            .unwrap();

        assert!(ran.is_none());
        assert_eq!(manager.queue().active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn local_wait_counts_against_max_wait() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);
        let holder = manager.clone();

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let long_section = tokio::spawn(async move {
            holder
                .with_lock("Blocking:doc", || async {
                    let _ = entered_tx.send(());
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    Ok(())
                })
                .await
        });
        entered_rx.await.unwrap();

        let started = Instant::now();
        let err = manager
            .with_lock("Blocking:doc", || async { Ok(()) })
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::LockTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(11));
        long_section.await.unwrap().unwrap();
    }
}
