//! Process-local FIFO in front of the distributed lock.
//!
//! Each key gets a fair `tokio::sync::Mutex`; holding its guard makes the
//! caller the key's runner. Waiters are served in arrival order, a cancelled
//! waiter simply drops out, and the per-key entry is removed once nobody
//! holds or waits for it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Queues = Arc<DashMap<String, Arc<Mutex<()>>>>;

#[derive(Clone, Default)]
pub struct LockQueue {
    queues: Queues,
}

impl LockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this process's turn on `key`.
    ///
    /// Dropping the returned future before it completes leaves the queue
    /// without affecting the other waiters.
    pub async fn enqueue(&self, key: &str) -> LockTicket {
        let slot = self.slot(key);
        let guard = slot.mutex().lock_owned().await;
        LockTicket {
            guard: Some(guard),
            slot,
        }
    }

    /// Take the turn on `key` only if nobody holds or waits for it.
    pub fn try_enqueue(&self, key: &str) -> Option<LockTicket> {
        let slot = self.slot(key);
        let guard = slot.mutex().try_lock_owned().ok()?;
        Some(LockTicket {
            guard: Some(guard),
            slot,
        })
    }

    /// Number of keys with a runner or waiters.
    pub fn active_keys(&self) -> usize {
        self.queues.len()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.queues.contains_key(key)
    }

    fn slot(&self, key: &str) -> QueueSlot {
        let mutex = Arc::clone(&self.queues.entry(key.to_string()).or_default());
        QueueSlot {
            key: key.to_string(),
            mutex,
            queues: Arc::clone(&self.queues),
        }
    }
}

/// One participant (waiter or runner) in a key's queue.
struct QueueSlot {
    key: String,
    mutex: Arc<Mutex<()>>,
    queues: Queues,
}

impl QueueSlot {
    fn mutex(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.mutex)
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        // The map's reference plus ours: nobody else holds or waits.
        self.queues
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 2);
    }
}

/// The right to run on a key. Dropping it hands the turn to the next waiter.
#[must_use = "dropping a ticket immediately hands the turn to the next waiter"]
pub struct LockTicket {
    guard: Option<OwnedMutexGuard<()>>,
    slot: QueueSlot,
}

impl LockTicket {
    pub fn key(&self) -> &str {
        &self.slot.key
    }
}

impl Drop for LockTicket {
    fn drop(&mut self) {
        // Guard first so the slot sees an accurate reference count.
        self.guard.take();
    }
}

impl std::fmt::Debug for LockTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTicket").field("key", &self.key()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::task::spawn;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let queue = LockQueue::new();
        let first = queue.enqueue("k").await;

        let mut second = spawn(queue.enqueue("k"));
        let mut third = spawn(queue.enqueue("k"));
        assert_pending!(second.poll());
        assert_pending!(third.poll());

        drop(first);
        assert!(second.is_woken());
        let second_ticket = assert_ready!(second.poll());
        assert_pending!(third.poll());

        drop(second_ticket);
        let third_ticket = assert_ready!(third.poll());
        assert_eq!(third_ticket.key(), "k");
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_block_the_rest() {
        let queue = LockQueue::new();
        let first = queue.enqueue("k").await;

        let mut second = spawn(queue.enqueue("k"));
        let mut third = spawn(queue.enqueue("k"));
        assert_pending!(second.poll());
        assert_pending!(third.poll());

        drop(second);
        drop(first);

        let _third_ticket = assert_ready!(third.poll());
    }

    #[tokio::test]
    async fn queue_is_freed_when_the_last_participant_leaves() {
        let queue = LockQueue::new();

        let ticket = queue.enqueue("k").await;
        let mut waiter = spawn(queue.enqueue("k"));
        assert_pending!(waiter.poll());
        assert!(queue.is_active("k"));

        drop(ticket);
        let next = assert_ready!(waiter.poll());
        drop(waiter);
        assert!(queue.is_active("k"));

        drop(next);
        assert_eq!(queue.active_keys(), 0);
    }

    #[tokio::test]
    async fn cancelling_the_only_waiter_frees_the_queue() {
        let queue = LockQueue::new();
        let ticket = queue.enqueue("k").await;
        let mut waiter = spawn(queue.enqueue("k"));
        assert_pending!(waiter.poll());

        drop(waiter);
        drop(ticket);

        assert!(!queue.is_active("k"));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let queue = LockQueue::new();
        let _a = queue.enqueue("a").await;

        let b = queue.try_enqueue("b");
        assert!(b.is_some());
        assert!(queue.try_enqueue("a").is_none());
        assert_eq!(queue.active_keys(), 2);
    }
}
