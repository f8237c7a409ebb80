//! Background sweep of the shared `pending-updates-list`.
//!
//! Every enqueue announces its document id on the shared list. The
//! dispatcher pops ids off it and starts a non-blocking flush for each
//! document that this process is not already flushing. A document that is
//! mid-flush is skipped: the running flush keeps going while ops remain.
//! A document locked by another process is dropped from the sweep as well,
//! since the lock holder drains the queue again after releasing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{FlushMode, FlushOutcome, FlushWorker, InProgressSet};
use crate::broadcast::PubSub;
use crate::document::{DocumentId, DocumentStore};
use crate::error::{SyncError, SyncResult};
use crate::store::{SharedStore, keys};

const LOG_TARGET: &str = "collab_sync::dispatcher";

pub struct Dispatcher<S, D, P> {
    store: Arc<S>,
    worker: Arc<FlushWorker<S, D, P>>,
    in_progress: InProgressSet<DocumentId>,
    sweep_interval: Duration,
}

/// Handle to a running dispatcher loop.
pub struct DispatcherHandle {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl DispatcherHandle {
    /// Stop the loop and wait for it to exit. Flushes already started finish
    /// on their own.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.join_handle.await {
            log::warn!(target: LOG_TARGET, "Dispatcher task ended abnormally: {}", e);
        }
    }
}

impl<S, D, P> Dispatcher<S, D, P>
where
    S: SharedStore,
    D: DocumentStore,
    P: PubSub,
{
    pub fn new(store: Arc<S>, worker: Arc<FlushWorker<S, D, P>>, sweep_interval: Duration) -> Self {
        Self {
            store,
            worker,
            in_progress: InProgressSet::new(),
            sweep_interval,
        }
    }

    /// Documents this process is flushing right now.
    pub fn in_progress(&self) -> &InProgressSet<DocumentId> {
        &self.in_progress
    }

    /// Run the sweep loop on a new task until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let join_handle = tokio::spawn(async move { self.run(token).await });
        DispatcherHandle {
            join_handle,
            cancel_token,
        }
    }

    /// Sweep once per `sweep_interval` until `cancel_token` is cancelled.
    pub async fn run(&self, cancel_token: CancellationToken) {
        loop {
            match self.sweep().await {
                Ok(0) => {}
                Ok(started) => {
                    log::trace!(target: LOG_TARGET, "Started {} flush(es)", started);
                }
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "Sweep failed: {}", e);
                }
            }

            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(self.sweep_interval) => {}
            }
        }
        log::debug!(target: LOG_TARGET, "Dispatcher stopped");
    }

    /// Pop every announced document id and start flushes.
    ///
    /// Returns how many flushes were started.
    pub async fn sweep(&self) -> SyncResult<usize> {
        let mut started = 0;
        while let Some(raw) = self
            .store
            .pop_front(keys::PENDING_UPDATES_LIST)
            .await
            .map_err(|e| SyncError::store(keys::PENDING_UPDATES_LIST, "popping pending docs", e))?
        {
            let doc_id = DocumentId::new(raw);
            if !self.in_progress.try_start(&doc_id) {
                log::trace!(
                    target: LOG_TARGET,
                    "{} is already being flushed here, skipping",
                    doc_id
                );
                continue;
            }
            self.spawn_flush(doc_id);
            started += 1;
        }
        Ok(started)
    }

    fn spawn_flush(&self, doc_id: DocumentId) {
        let store = Arc::clone(&self.store);
        let worker = Arc::clone(&self.worker);
        let in_progress = self.in_progress.clone();
        let retry_delay = self.sweep_interval;
        tokio::spawn(async move {
            let reannounce_after = match worker.flush(&doc_id, FlushMode::NonBlocking).await {
                Ok(FlushOutcome::Applied(updates)) => {
                    log::debug!(
                        target: LOG_TARGET,
                        "Flushed {} op(s) for {}",
                        updates.len(),
                        doc_id
                    );
                    Some(Duration::ZERO)
                }
                Ok(FlushOutcome::Busy) => {
                    // The holder re-checks the queue after releasing the lock.
                    log::debug!(
                        target: LOG_TARGET,
                        "{} is locked by another process",
                        doc_id
                    );
                    None
                }
                Err(e) => {
                    log::error!(target: LOG_TARGET, "Flush of {} failed: {}", doc_id, e);
                    Some(retry_delay)
                }
            };
            in_progress.finish(&doc_id);

            let Some(delay) = reannounce_after else {
                return;
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // Ops left behind (announcements skipped while this flush ran, or
            // ops requeued after a failure) need another announcement.
            if matches!(worker.pending_len(&doc_id).await, Ok(n) if n > 0) {
                if let Err(e) = store
                    .push_back(keys::PENDING_UPDATES_LIST, doc_id.to_string())
                    .await
                {
                    log::warn!(target: LOG_TARGET, "Could not re-announce {}: {}", doc_id, e);
                }
            }
        });
    }
}
