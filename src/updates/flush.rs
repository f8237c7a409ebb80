//! Applies queued operations under the document lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{AppliedUpdate, QueueOptions};
use crate::broadcast::{BroadcastChannel, PubSub};
use crate::document::{ConnectionId, DocumentId, DocumentStore, EditOperation, PersistenceError};
use crate::error::{SyncError, SyncResult};
use crate::lock::LockManager;
use crate::store::{SharedStore, StoreResult, keys};

const LOG_TARGET: &str = "collab_sync::flush";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Wait for the document lock
    Blocking,
    /// Give up immediately if the lock is taken
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Applied(Vec<AppliedUpdate>),
    /// Another runner holds the document; it will see the queued ops
    Busy,
}

impl FlushOutcome {
    pub fn applied(&self) -> &[AppliedUpdate] {
        match self {
            FlushOutcome::Applied(updates) => updates,
            FlushOutcome::Busy => &[],
        }
    }
}

/// Entry of the recently-applied log used to spot resubmitted ops.
#[derive(Debug, Serialize, Deserialize)]
struct AppliedOpRecord {
    version: u64,
    #[serde(default)]
    source: Option<ConnectionId>,
}

/// Drains document queues into the persistence layer and the bus.
pub struct FlushWorker<S, D, P> {
    store: Arc<S>,
    documents: Arc<D>,
    locks: Arc<LockManager<S>>,
    broadcast: BroadcastChannel<P>,
    options: QueueOptions,
}

impl<S, D, P> FlushWorker<S, D, P>
where
    S: SharedStore,
    D: DocumentStore,
    P: PubSub,
{
    pub fn new(
        store: Arc<S>,
        documents: Arc<D>,
        locks: Arc<LockManager<S>>,
        broadcast: BroadcastChannel<P>,
        options: QueueOptions,
    ) -> Self {
        Self {
            store,
            documents,
            locks,
            broadcast,
            options,
        }
    }

    /// Apply every pending op of `doc_id`.
    ///
    /// Ops that arrive while the lock is held are picked up by another round
    /// before returning. In `NonBlocking` mode a busy lock yields
    /// [`FlushOutcome::Busy`] (or the rounds done so far).
    ///
    /// A rejected op drops the rest of its batch. Any other failure puts the
    /// unapplied ops back at the head of the queue before returning the error.
    pub async fn flush(&self, doc_id: &DocumentId, mode: FlushMode) -> SyncResult<FlushOutcome> {
        let key = keys::blocking(doc_id);
        let mut applied = Vec::new();

        loop {
            let round = match mode {
                FlushMode::Blocking => {
                    self.locks
                        .with_lock(&key, || self.apply_pending(doc_id))
                        .await?
                }
                FlushMode::NonBlocking => {
                    match self
                        .locks
                        .try_with_lock(&key, || self.apply_pending(doc_id))
                        .await?
                    {
                        Some(round) => round,
                        None if applied.is_empty() => {
                            log::debug!(target: LOG_TARGET, "{} is busy, not flushing", doc_id);
                            return Ok(FlushOutcome::Busy);
                        }
                        None => break,
                    }
                }
            };
            applied.extend(round);

            if self.pending_len(doc_id).await? == 0 {
                break;
            }
            log::debug!(
                target: LOG_TARGET,
                "More ops arrived for {} during the flush, continuing",
                doc_id
            );
        }

        Ok(FlushOutcome::Applied(applied))
    }

    /// Number of ops waiting in the queue of `doc_id`.
    pub async fn pending_len(&self, doc_id: &DocumentId) -> SyncResult<usize> {
        self.store
            .len(&keys::pending_updates(doc_id))
            .await
            .map_err(|e| SyncError::store(doc_id.as_str(), "reading queue length", e))
    }

    /// One drain-and-apply round. Must run under the document lock.
    async fn apply_pending(&self, doc_id: &DocumentId) -> SyncResult<Vec<AppliedUpdate>> {
        let entries = self
            .store
            .drain(&keys::pending_updates(doc_id))
            .await
            .map_err(|e| SyncError::store(doc_id.as_str(), "draining queue", e))?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        log::debug!(
            target: LOG_TARGET,
            "Applying {} queued op(s) to {}",
            entries.len(),
            doc_id
        );

        let mut applied = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let op: EditOperation = match serde_json::from_str(entry) {
                Ok(op) => op,
                Err(e) => {
                    log::error!(
                        target: LOG_TARGET,
                        "Skipping undecodable queue entry {} for {}: {}",
                        index,
                        doc_id,
                        e
                    );
                    continue;
                }
            };

            match self.apply_one(doc_id, op).await {
                Ok(update) => {
                    if let Err(e) = self.broadcast.publish(&update).await {
                        // Subscribers notice the missing version and resync.
                        log::error!(
                            target: LOG_TARGET,
                            "Failed to publish version {} of {}: {}",
                            update.version,
                            doc_id,
                            e
                        );
                    }
                    applied.push(update);
                }
                Err(e @ SyncError::ApplyRejected { .. }) => {
                    let dropped = entries.len() - index - 1;
                    log::error!(
                        target: LOG_TARGET,
                        "Op {} for {} was rejected, dropping {} remaining op(s): {}",
                        index,
                        doc_id,
                        dropped,
                        e
                    );
                    if let Err(publish_err) =
                        self.broadcast.publish_rejection(doc_id, &e.to_string()).await
                    {
                        log::error!(
                            target: LOG_TARGET,
                            "Failed to publish rejection for {}: {}",
                            doc_id,
                            publish_err
                        );
                    }
                    return Err(e);
                }
                Err(e) => {
                    // The op itself may be fine; keep it and the rest for a later flush.
                    self.requeue(doc_id, entries[index..].to_vec()).await;
                    log::warn!(
                        target: LOG_TARGET,
                        "Op {} for {} could not be applied, requeued {} op(s): {}",
                        index,
                        doc_id,
                        entries.len() - index,
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }

    /// Put unapplied entries back at the head of the queue, ahead of ops
    /// enqueued during the failed round.
    async fn requeue(&self, doc_id: &DocumentId, entries: Vec<String>) {
        let count = entries.len();
        if let Err(e) = self
            .store
            .push_front_all(&keys::pending_updates(doc_id), entries)
            .await
        {
            log::error!(
                target: LOG_TARGET,
                "Lost {} op(s) for {}: could not requeue them: {}",
                count,
                doc_id,
                e
            );
        }
    }

    async fn apply_one(&self, doc_id: &DocumentId, op: EditOperation) -> SyncResult<AppliedUpdate> {
        let mut conflicts = 0;
        loop {
            let snapshot = self
                .documents
                .get_document(doc_id)
                .await
                .map_err(|e| SyncError::persistence(doc_id.as_str(), "reading snapshot", e))?;

            if self.is_duplicate(doc_id, &op).await? {
                log::debug!(
                    target: LOG_TARGET,
                    "Op from {:?} on {} was already applied, flagging duplicate",
                    op.source(),
                    doc_id
                );
                return Ok(AppliedUpdate {
                    doc_id: doc_id.clone(),
                    version: snapshot.version,
                    source: op.source().cloned(),
                    op,
                    dup: true,
                });
            }

            match self
                .documents
                .apply_op(doc_id, &op, snapshot.version)
                .await
            {
                Ok(version) => {
                    self.record_applied(doc_id, &op, version).await;
                    return Ok(AppliedUpdate {
                        doc_id: doc_id.clone(),
                        version,
                        source: op.source().cloned(),
                        op,
                        dup: false,
                    });
                }
                Err(PersistenceError::VersionConflict { expected, actual })
                    if conflicts < self.options.version_conflict_retries =>
                {
                    conflicts += 1;
                    log::debug!(
                        target: LOG_TARGET,
                        "Version conflict on {} (expected {}, found {}), retry {}",
                        doc_id,
                        expected,
                        actual,
                        conflicts
                    );
                }
                Err(e) => {
                    return Err(SyncError::persistence(doc_id.as_str(), "applying op", e));
                }
            }
        }
    }

    /// An op is a duplicate when one of its `dupIfSource` connections
    /// already got an op applied on top of the op's base version.
    async fn is_duplicate(&self, doc_id: &DocumentId, op: &EditOperation) -> SyncResult<bool> {
        if op.dup_if_source.is_empty() {
            return Ok(false);
        }
        let recent = self
            .store
            .range(&keys::doc_ops(doc_id))
            .await
            .map_err(|e| SyncError::store(doc_id.as_str(), "reading recent ops", e))?;

        Ok(recent
            .iter()
            .filter_map(|entry| serde_json::from_str::<AppliedOpRecord>(entry).ok())
            .any(|record| {
                record.version > op.base_version
                    && record
                        .source
                        .as_ref()
                        .is_some_and(|source| op.dup_if_source.contains(source))
            }))
    }

    async fn record_applied(&self, doc_id: &DocumentId, op: &EditOperation, version: u64) {
        let record = AppliedOpRecord {
            version,
            source: op.source().cloned(),
        };
        let Ok(entry) = serde_json::to_string(&record) else {
            return;
        };
        let key = keys::doc_ops(doc_id);
        let result: StoreResult<()> = async {
            self.store.push_back(&key, entry).await?;
            self.store
                .trim_to_last(&key, self.options.recent_ops_len)
                .await
        }
        .await;
        if let Err(e) = result {
            log::warn!(
                target: LOG_TARGET,
                "Could not record version {} of {} for duplicate detection: {}",
                version,
                doc_id,
                e
            );
        }
    }
}
