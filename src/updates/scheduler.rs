//! Debounced flush triggers.
//!
//! Each document has an independent inactivity timer that restarts on every
//! `schedule`. When it fires the queue is flushed without blocking, and only
//! if something is actually pending.
//!
//! ```text
//! schedule(doc)
//!       │
//!       ├─► Cancel previous timer (if any)
//!       │
//!       └─► Spawn new timer task
//!               │
//!               ├─► Wait flush delay (500ms default)
//!               │
//!               └─► Detach: pending? → flush(doc, NonBlocking)
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;

use super::{FlushMode, FlushOutcome, FlushWorker};
use crate::broadcast::PubSub;
use crate::config::defaults::DEFAULT_FLUSH_DELAY_MS;
use crate::document::{DocumentId, DocumentStore};
use crate::store::SharedStore;

const LOG_TARGET: &str = "collab_sync::scheduler";

/// Finished timers are swept out once the map grows past this.
const CLEANUP_THRESHOLD: usize = 32;

pub struct FlushScheduler<S, D, P> {
    worker: Arc<FlushWorker<S, D, P>>,
    /// Active timers per document
    active_timers: DashMap<DocumentId, AbortHandle>,
    delay: Duration,
}

impl<S, D, P> FlushScheduler<S, D, P>
where
    S: SharedStore,
    D: DocumentStore,
    P: PubSub,
{
    pub fn new(worker: Arc<FlushWorker<S, D, P>>) -> Self {
        Self::with_delay(worker, Duration::from_millis(DEFAULT_FLUSH_DELAY_MS))
    }

    pub fn with_delay(worker: Arc<FlushWorker<S, D, P>>, delay: Duration) -> Self {
        Self {
            worker,
            active_timers: DashMap::new(),
            delay,
        }
    }

    /// Start (or restart) the inactivity timer of `doc_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, doc_id: DocumentId) {
        if self.active_timers.len() > CLEANUP_THRESHOLD {
            self.active_timers.retain(|_, handle| !handle.is_finished());
        }

        if let Some((_, previous)) = self.active_timers.remove(&doc_id) {
            previous.abort();
            log::trace!(
                target: LOG_TARGET,
                "Restarted flush timer for {}",
                doc_id
            );
        }

        let worker = Arc::clone(&self.worker);
        let delay = self.delay;
        let timer_doc = doc_id.clone();
        // Only the wait is abortable; a flush that started runs to completion
        // so it never stops while holding the document lock.
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(async move { flush_if_pending(&worker, &timer_doc).await });
        });

        self.active_timers.insert(doc_id, task.abort_handle());
    }

    /// Cancel the timer of `doc_id`, e.g. when the document is closed.
    pub fn cancel(&self, doc_id: &DocumentId) {
        if let Some((_, handle)) = self.active_timers.remove(doc_id) {
            handle.abort();
            log::trace!(
                target: LOG_TARGET,
                "Cancelled flush timer for {}",
                doc_id
            );
        }
    }

    /// Cancel every timer. Called on shutdown.
    pub fn cancel_all(&self) {
        for entry in self.active_timers.iter() {
            entry.value().abort();
        }
        self.active_timers.clear();
        log::debug!(target: LOG_TARGET, "Cancelled all flush timers");
    }

    pub fn has_active_timer(&self, doc_id: &DocumentId) -> bool {
        self.active_timers
            .get(doc_id)
            .is_some_and(|handle| !handle.is_finished())
    }
}

async fn flush_if_pending<S, D, P>(worker: &FlushWorker<S, D, P>, doc_id: &DocumentId)
where
    S: SharedStore,
    D: DocumentStore,
    P: PubSub,
{
    match worker.pending_len(doc_id).await {
        Ok(0) => {
            log::trace!(target: LOG_TARGET, "Timer fired for {} with nothing queued", doc_id);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            log::warn!(target: LOG_TARGET, "Could not check queue of {}: {}", doc_id, e);
            return;
        }
    }

    match worker.flush(doc_id, FlushMode::NonBlocking).await {
        Ok(FlushOutcome::Applied(updates)) => {
            log::debug!(
                target: LOG_TARGET,
                "Timer flush applied {} op(s) to {}",
                updates.len(),
                doc_id
            );
        }
        Ok(FlushOutcome::Busy) => {
            log::debug!(
                target: LOG_TARGET,
                "Timer flush for {} skipped, lock is busy",
                doc_id
            );
        }
        Err(e) => {
            log::error!(target: LOG_TARGET, "Timer flush for {} failed: {}", doc_id, e);
        }
    }
}
